//! ABOUTME: DecisionGateService: classifies a proposed action and decides approve/human/escalate (spec §4.8)
//! ABOUTME: Thresholds are inclusive; category-to-stage routing is fixed per spec §6

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionCategory {
    TechnicalRefactor,
    CostImpacting,
    SecurityAffecting,
    ArchitecturalChange,
    DataMigration,
}

impl DecisionCategory {
    /// Required-confidence thresholds from spec §4.8.
    pub fn required_confidence(self) -> f64 {
        match self {
            DecisionCategory::TechnicalRefactor => 0.85,
            DecisionCategory::CostImpacting => 0.92,
            DecisionCategory::SecurityAffecting => 1.00,
            DecisionCategory::ArchitecturalChange => 0.90,
            DecisionCategory::DataMigration => 0.95,
        }
    }

    /// These categories always require human approval regardless of
    /// confidence (spec §4.8).
    pub fn always_requires_human(self) -> bool {
        matches!(
            self,
            DecisionCategory::CostImpacting
                | DecisionCategory::SecurityAffecting
                | DecisionCategory::ArchitecturalChange
                | DecisionCategory::DataMigration
        )
    }
}

const ESCALATION_CONFIDENCE_FLOOR: f64 = 0.80;

#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub category: DecisionCategory,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub auto_approved: bool,
    pub requires_human_approval: bool,
    pub should_escalate: bool,
    pub escalation_route: Option<String>,
}

/// A decision-gate service configured with one escalation route; stateless
/// otherwise (category thresholds are fixed constants, spec §4.8).
pub struct DecisionGateService {
    escalation_route: String,
}

impl Default for DecisionGateService {
    fn default() -> Self {
        Self::new("human-review-queue")
    }
}

impl DecisionGateService {
    pub fn new(escalation_route: impl Into<String>) -> Self {
        Self {
            escalation_route: escalation_route.into(),
        }
    }

    /// `technical_refactor` auto-approves iff `confidence ≥ threshold`;
    /// every other category always requires human approval. Escalation is
    /// independent of category: `confidence < 0.80` escalates (spec §4.8,
    /// boundary inclusive at exactly `0.80`).
    pub fn evaluate_decision(&self, request: &DecisionRequest) -> DecisionOutcome {
        let threshold = request.category.required_confidence();
        let always_human = request.category.always_requires_human();

        let auto_approved = !always_human && request.confidence >= threshold;
        let requires_human_approval = always_human || !auto_approved;
        let should_escalate = request.confidence < ESCALATION_CONFIDENCE_FLOOR;

        DecisionOutcome {
            auto_approved,
            requires_human_approval,
            should_escalate,
            escalation_route: should_escalate.then(|| self.escalation_route.clone()),
        }
    }

    /// `scaffolding, deployment, integration, migration` (spec §4.8).
    pub fn should_evaluate_decision(&self, stage: &str) -> bool {
        matches!(stage, "scaffolding" | "deployment" | "integration" | "migration")
    }

    /// `initialization, requirements_analysis` (spec §4.8).
    pub fn should_evaluate_clarification(&self, stage: &str) -> bool {
        matches!(stage, "initialization" | "requirements_analysis")
    }

    /// Category assignment by `(stage, workflow_type)` from spec §6.
    pub fn category_for(&self, stage: &str, workflow_type: &str) -> DecisionCategory {
        match stage {
            "scaffolding" => DecisionCategory::ArchitecturalChange,
            "deployment" if workflow_type == "app" => DecisionCategory::CostImpacting,
            "deployment" => DecisionCategory::TechnicalRefactor,
            "integration" => DecisionCategory::ArchitecturalChange,
            "migration" => DecisionCategory::DataMigration,
            _ => DecisionCategory::TechnicalRefactor,
        }
    }
}

const AMBIGUITY_LEXICON: &[&str] = &[
    "maybe", "might", "could", "probably", "several", "few", "some", "perhaps", "possibly",
    "approximately", "roughly", "tbd", "unclear", "unsure",
];

const MIN_REQUIREMENTS_LEN: usize = 20;

#[derive(Debug, Clone)]
pub struct ClarificationRequest {
    pub requirements: String,
    pub acceptance_criteria: Vec<String>,
    pub confidence: f64,
}

/// Triggers on an ambiguity-lexicon hit, empty acceptance criteria, too-short
/// requirements text, or low confidence (spec §4.8, any one is sufficient).
pub fn needs_clarification(request: &ClarificationRequest) -> bool {
    let trimmed = request.requirements.trim();
    let lowercase = trimmed.to_lowercase();
    let lexicon_hit = AMBIGUITY_LEXICON
        .iter()
        .any(|token| lowercase.split_whitespace().any(|word| word.trim_matches(|c: char| !c.is_alphanumeric()) == *token));

    lexicon_hit
        || request.acceptance_criteria.is_empty()
        || trimmed.len() < MIN_REQUIREMENTS_LEN
        || request.confidence < 0.70
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> DecisionGateService {
        DecisionGateService::default()
    }

    #[test]
    fn technical_refactor_auto_approves_at_and_above_threshold() {
        let outcome = service().evaluate_decision(&DecisionRequest {
            category: DecisionCategory::TechnicalRefactor,
            confidence: 0.85,
        });
        assert!(outcome.auto_approved);
        assert!(!outcome.requires_human_approval);
    }

    #[test]
    fn technical_refactor_does_not_auto_approve_just_below_threshold() {
        let outcome = service().evaluate_decision(&DecisionRequest {
            category: DecisionCategory::TechnicalRefactor,
            confidence: 0.84,
        });
        assert!(!outcome.auto_approved);
        assert!(outcome.requires_human_approval);
    }

    #[test]
    fn always_human_categories_require_approval_even_at_perfect_confidence() {
        for category in [
            DecisionCategory::CostImpacting,
            DecisionCategory::SecurityAffecting,
            DecisionCategory::ArchitecturalChange,
            DecisionCategory::DataMigration,
        ] {
            let outcome = service().evaluate_decision(&DecisionRequest { category, confidence: 1.0 });
            assert!(!outcome.auto_approved);
            assert!(outcome.requires_human_approval);
        }
    }

    #[test]
    fn escalation_boundary_at_0_80_does_not_escalate() {
        let outcome = service().evaluate_decision(&DecisionRequest {
            category: DecisionCategory::TechnicalRefactor,
            confidence: 0.80,
        });
        assert!(!outcome.should_escalate);
        assert!(outcome.escalation_route.is_none());
    }

    #[test]
    fn confidence_below_0_80_escalates_with_configured_route() {
        let outcome = service().evaluate_decision(&DecisionRequest {
            category: DecisionCategory::TechnicalRefactor,
            confidence: 0.5,
        });
        assert!(outcome.should_escalate);
        assert_eq!(outcome.escalation_route.as_deref(), Some("human-review-queue"));
    }

    #[test]
    fn category_routing_matches_stage_and_workflow_type_table() {
        let svc = service();
        assert_eq!(svc.category_for("scaffolding", "app"), DecisionCategory::ArchitecturalChange);
        assert_eq!(svc.category_for("deployment", "app"), DecisionCategory::CostImpacting);
        assert_eq!(svc.category_for("deployment", "library"), DecisionCategory::TechnicalRefactor);
        assert_eq!(svc.category_for("integration", "app"), DecisionCategory::ArchitecturalChange);
        assert_eq!(svc.category_for("migration", "app"), DecisionCategory::DataMigration);
        assert_eq!(svc.category_for("unknown_stage", "app"), DecisionCategory::TechnicalRefactor);
    }

    #[test]
    fn clarification_triggers_on_ambiguity_lexicon() {
        let req = ClarificationRequest {
            requirements: "We might need several endpoints for this feature".to_string(),
            acceptance_criteria: vec!["works".to_string()],
            confidence: 0.9,
        };
        assert!(needs_clarification(&req));
    }

    #[test]
    fn clarification_triggers_on_empty_acceptance_criteria() {
        let req = ClarificationRequest {
            requirements: "Build a fully specified REST API with clear contracts".to_string(),
            acceptance_criteria: vec![],
            confidence: 0.9,
        };
        assert!(needs_clarification(&req));
    }

    #[test]
    fn clarification_does_not_trigger_on_clear_well_specified_input() {
        let req = ClarificationRequest {
            requirements: "Build a fully specified REST API with clear contracts".to_string(),
            acceptance_criteria: vec!["returns 200 on success".to_string()],
            confidence: 0.95,
        };
        assert!(!needs_clarification(&req));
    }
}
