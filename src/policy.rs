//! Class-to-treatment redaction table.
//!
//! The table is data, not code: it is built once (from compiled defaults, explicit
//! rules, or a TOML policy file) and is immutable afterwards. Lookups are total;
//! any class without a rule passes through untouched.
//!
//! Policy file format:
//!
//! ```toml
//! [[class]]
//! id = 0
//! treatment = "suppress"
//! fill = [0.92, 0.75, 0.56, 1.0]
//!
//! [[class]]
//! id = 4
//! treatment = "passthrough"
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::PipelineError;
use crate::meta::Rgba;

/// Fill used for class 0 (faces in the stock detector model).
pub const FACE_FILL: Rgba = Rgba::new(0.92, 0.75, 0.56, 1.0);
/// Fill used for class 1 (license plates in the stock detector model).
pub const PLATE_FILL: Rgba = Rgba::BLACK;

/// Visual treatment for one object class.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Treatment {
    /// Opaque fill over the box, no border, label hidden.
    Suppress { fill: Rgba },
    /// Leave the detector's draw attributes alone.
    Passthrough,
}

/// Immutable class → treatment mapping.
#[derive(Clone, Debug, PartialEq)]
pub struct RedactionPolicy {
    rules: HashMap<u32, Treatment>,
}

impl RedactionPolicy {
    /// Build a table from explicit `(class_id, treatment)` rules.
    ///
    /// A later rule for the same class replaces an earlier one.
    pub fn from_rules<I>(rules: I) -> Self
    where
        I: IntoIterator<Item = (u32, Treatment)>,
    {
        Self {
            rules: rules.into_iter().collect(),
        }
    }

    /// Table that passes every class through.
    pub fn passthrough() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    pub fn treatment_for(&self, class_id: u32) -> Treatment {
        self.rules
            .get(&class_id)
            .copied()
            .unwrap_or(Treatment::Passthrough)
    }

    /// Classes with an explicit suppress rule, ascending.
    pub fn suppressed_classes(&self) -> Vec<u32> {
        let mut classes: Vec<u32> = self
            .rules
            .iter()
            .filter(|(_, t)| matches!(t, Treatment::Suppress { .. }))
            .map(|(id, _)| *id)
            .collect();
        classes.sort_unstable();
        classes
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, PipelineError> {
        let file: PolicyFile = toml::from_str(raw)
            .map_err(|e| PipelineError::configuration(format!("invalid policy: {}", e)))?;
        file.into_policy()
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::configuration(format!(
                "failed to read policy file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&raw)
    }
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self::from_rules([
            (0, Treatment::Suppress { fill: FACE_FILL }),
            (1, Treatment::Suppress { fill: PLATE_FILL }),
        ])
    }
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default, rename = "class")]
    classes: Vec<ClassRule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TreatmentKind {
    Suppress,
    Passthrough,
}

#[derive(Debug, Deserialize)]
struct ClassRule {
    id: u32,
    treatment: TreatmentKind,
    fill: Option<[f64; 4]>,
}

impl PolicyFile {
    fn into_policy(self) -> Result<RedactionPolicy, PipelineError> {
        let mut rules = HashMap::with_capacity(self.classes.len());
        for rule in self.classes {
            let treatment = match rule.treatment {
                TreatmentKind::Passthrough => Treatment::Passthrough,
                TreatmentKind::Suppress => {
                    let fill: Rgba = rule
                        .fill
                        .ok_or_else(|| {
                            PipelineError::configuration(format!(
                                "class {} is suppressed but has no fill color",
                                rule.id
                            ))
                        })?
                        .into();
                    if !fill.is_normalized() {
                        return Err(PipelineError::configuration(format!(
                            "class {} fill components must lie in 0.0..=1.0",
                            rule.id
                        )));
                    }
                    Treatment::Suppress { fill }
                }
            };
            if rules.insert(rule.id, treatment).is_some() {
                return Err(PipelineError::configuration(format!(
                    "class {} appears more than once in the policy",
                    rule.id
                )));
            }
        }
        Ok(RedactionPolicy { rules })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_suppress_faces_and_plates() {
        let policy = RedactionPolicy::default();
        assert_eq!(
            policy.treatment_for(0),
            Treatment::Suppress {
                fill: Rgba::new(0.92, 0.75, 0.56, 1.0)
            }
        );
        assert_eq!(
            policy.treatment_for(1),
            Treatment::Suppress {
                fill: Rgba::new(0.0, 0.0, 0.0, 1.0)
            }
        );
        assert_eq!(policy.treatment_for(2), Treatment::Passthrough);
        assert_eq!(policy.treatment_for(u32::MAX), Treatment::Passthrough);
        assert_eq!(policy.suppressed_classes(), vec![0, 1]);
    }

    #[test]
    fn loads_rules_from_toml() {
        let policy = RedactionPolicy::from_toml_str(
            r#"
            [[class]]
            id = 3
            treatment = "suppress"
            fill = [0.1, 0.2, 0.3, 1.0]

            [[class]]
            id = 0
            treatment = "passthrough"
            "#,
        )
        .unwrap();
        assert_eq!(
            policy.treatment_for(3),
            Treatment::Suppress {
                fill: Rgba::new(0.1, 0.2, 0.3, 1.0)
            }
        );
        assert_eq!(policy.treatment_for(0), Treatment::Passthrough);
        assert_eq!(policy.treatment_for(1), Treatment::Passthrough);
    }

    #[test]
    fn empty_policy_file_passes_everything() {
        let policy = RedactionPolicy::from_toml_str("").unwrap();
        assert_eq!(policy, RedactionPolicy::passthrough());
    }

    #[test]
    fn suppress_without_fill_is_rejected() {
        let err = RedactionPolicy::from_toml_str(
            r#"
            [[class]]
            id = 0
            treatment = "suppress"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no fill"));
    }

    #[test]
    fn out_of_range_fill_is_rejected() {
        let result = RedactionPolicy::from_toml_str(
            r#"
            [[class]]
            id = 0
            treatment = "suppress"
            fill = [2.0, 0.0, 0.0, 1.0]
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_class_is_rejected() {
        let result = RedactionPolicy::from_toml_str(
            r#"
            [[class]]
            id = 7
            treatment = "passthrough"

            [[class]]
            id = 7
            treatment = "passthrough"
            "#,
        );
        assert!(result.is_err());
    }
}
