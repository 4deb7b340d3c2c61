// Archivo: plan.rs
// Propósito: `MigrationPlan`, secuencia ordenada y versionada de reglas.
use crate::errors::{MigrationError, Result};
use crate::rule::TransformRule;
use std::collections::HashSet;

/// Plan de migración con nombre. Las versiones son únicas, positivas y
/// estrictamente crecientes.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub name: String,
    rules: Vec<TransformRule>,
}

impl MigrationPlan {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(),
               rules: Vec::new() }
    }

    /// Añade una regla al final del plan (estilo builder).
    pub fn rule(mut self, rule: TransformRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[TransformRule] {
        &self.rules
    }

    /// Versión de la última regla, 0 si el plan está vacío.
    pub fn latest_version(&self) -> i64 {
        self.rules.last().map(|r| r.version).unwrap_or(0)
    }

    /// Índice de la regla con la versión dada.
    pub fn position(&self, version: i64) -> Option<usize> {
        self.rules.iter().position(|r| r.version == version)
    }

    /// Índice de la primera regla con versión mayor que `version`.
    pub fn first_after(&self, version: i64) -> Option<usize> {
        self.rules.iter().position(|r| r.version > version)
    }

    /// Verifica las invariantes del plan.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MigrationError::InvalidPlan("el plan necesita un nombre".into()));
        }
        if self.rules.is_empty() {
            return Err(MigrationError::InvalidPlan(format!("el plan '{}' no tiene reglas", self.name)));
        }
        let mut names = HashSet::new();
        let mut previous = 0i64;
        for rule in &self.rules {
            if rule.version <= previous {
                return Err(MigrationError::InvalidPlan(format!("versión {} de '{}' no es estrictamente creciente",
                                                               rule.version, rule.name)));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(MigrationError::InvalidPlan(format!("nombre de regla repetido '{}'", rule.name)));
            }
            previous = rule.version;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn noop(version: i64, name: &str) -> TransformRule {
        TransformRule::new(version, name, |_: &Value| false, |b: &Value| b.clone())
    }

    #[test]
    fn validate_rejects_non_increasing_versions() {
        let plan = MigrationPlan::new("p").rule(noop(2, "a")).rule(noop(2, "b"));
        assert!(matches!(plan.validate(), Err(MigrationError::InvalidPlan(_))));
        let plan = MigrationPlan::new("p").rule(noop(0, "a"));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn lookup_helpers() {
        let plan = MigrationPlan::new("p").rule(noop(1, "a")).rule(noop(5, "b"));
        assert!(plan.validate().is_ok());
        assert_eq!(plan.latest_version(), 5);
        assert_eq!(plan.first_after(1), Some(1));
        assert_eq!(plan.first_after(5), None);
        assert_eq!(plan.position(5), Some(1));
    }
}
