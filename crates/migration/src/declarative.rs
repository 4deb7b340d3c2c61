// Archivo: declarative.rs
// Propósito: definiciones declarativas de reglas (JSON) que se compilan a
// `TransformRule` con predicado e inversa derivados de la operación. Toda
// inversa restaura exactamente el documento que su regla transformó.
use crate::errors::{MigrationError, Result};
use crate::plan::MigrationPlan;
use crate::rule::{parent_is_object, get_path, remove_path, set_path, Transform, TransformRule};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Operación sobre campos, identificada por `op` en el JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldOperation {
    /// Mueve el valor de `from` a `to`.
    RenameField { from: String, to: String },
    /// Mueve el valor de `from` a una lista de un elemento en `to`. Sólo
    /// aplica si `to` no existe y el valor no es nulo; con `strings_only`
    /// exige además que sea una cadena.
    WrapInList {
        from: String,
        to: String,
        #[serde(default)]
        strings_only: bool,
    },
    /// Fija `value` en `path` cuando el campo no existe.
    SetDefault { path: String, value: JsonValue },
    /// Elimina el campo. No tiene inversa.
    RemoveField { path: String },
}

/// Regla declarada en un fichero de plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub version: i64,
    pub name: String,
    #[serde(flatten)]
    pub operation: FieldOperation,
}

/// Plan completo tal y como se lee de un fichero JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub name: String,
    /// Colección por defecto del plan (el CLI puede sobreescribirla).
    #[serde(default)]
    pub collection: Option<String>,
    pub rules: Vec<RuleDefinition>,
}

impl PlanDefinition {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Compila y valida el plan.
    pub fn into_plan(self) -> Result<MigrationPlan> {
        let plan = self.rules
                       .iter()
                       .map(RuleDefinition::compile)
                       .collect::<Result<Vec<_>>>()?
                       .into_iter()
                       .fold(MigrationPlan::new(self.name), MigrationPlan::rule);
        plan.validate()?;
        Ok(plan)
    }
}

impl RuleDefinition {
    /// Compila la operación a una regla con sus transformaciones.
    pub fn compile(&self) -> Result<TransformRule> {
        let (forward, backward) = match &self.operation {
            FieldOperation::RenameField { from, to } => {
                check_paths(&self.name, &[from, to])?;
                (move_field(from, to), Some(move_field(to, from)))
            }
            FieldOperation::WrapInList { from, to, strings_only } => {
                check_paths(&self.name, &[from, to])?;
                (wrap_in_list(from, to, *strings_only), Some(unwrap_single(to, from, *strings_only)))
            }
            FieldOperation::SetDefault { path, value } => {
                check_paths(&self.name, &[path])?;
                (set_default(path, value.clone()), Some(remove_default(path, value.clone())))
            }
            FieldOperation::RemoveField { path } => {
                check_paths(&self.name, &[path])?;
                (remove_field(path), None)
            }
        };
        Ok(TransformRule::from_parts(self.version, self.name.clone(), forward, backward))
    }
}

fn check_paths(rule: &str, paths: &[&String]) -> Result<()> {
    for p in paths {
        if p.is_empty() || p.split('.').any(str::is_empty) {
            return Err(MigrationError::InvalidPlan(format!("ruta inválida '{}' en la regla '{}'", p, rule)));
        }
    }
    if let [from, to] = paths {
        let nested = |a: &str, b: &str| b.strip_prefix(a).is_some_and(|rest| rest.starts_with('.'));
        if from == to || nested(from.as_str(), to.as_str()) || nested(to.as_str(), from.as_str()) {
            return Err(MigrationError::InvalidPlan(format!("la regla '{}' usa rutas de origen y destino solapadas", rule)));
        }
    }
    Ok(())
}

fn move_field(from: &str, to: &str) -> Transform {
    let (pf, ff, tf) = (from.to_string(), from.to_string(), to.to_string());
    let guard_to = to.to_string();
    Transform::new(move |b| get_path(b, &pf).is_some() && get_path(b, &guard_to).is_none() && parent_is_object(b, &guard_to),
                   move |b| {
                       let mut out = b.clone();
                       match remove_path(&mut out, &ff) {
                           Some(v) => {
                               if set_path(&mut out, &tf, v) {
                                   out
                               } else {
                                   b.clone()
                               }
                           }
                           None => b.clone(),
                       }
                   })
}

/// Valor que `wrap_in_list` acepta en el origen.
fn wrappable(value: &JsonValue, strings_only: bool) -> bool {
    if strings_only {
        value.is_string()
    } else {
        !value.is_null()
    }
}

fn wrap_in_list(from: &str, to: &str, strings_only: bool) -> Transform {
    let (pf, ff, tf, pt) = (from.to_string(), from.to_string(), to.to_string(), to.to_string());
    Transform::new(move |b| {
                       get_path(b, &pf).is_some_and(|v| wrappable(v, strings_only))
                       && get_path(b, &pt).is_none()
                       && parent_is_object(b, &pt)
                   },
                   move |b| {
                       let mut out = b.clone();
                       match remove_path(&mut out, &ff) {
                           Some(value) => {
                               if set_path(&mut out, &tf, JsonValue::Array(vec![value])) {
                                   out
                               } else {
                                   b.clone()
                               }
                           }
                           None => b.clone(),
                       }
                   })
}

/// Inversa de `wrap_in_list`: sólo actúa sobre listas de un elemento que
/// `wrap_in_list` pudo haber producido.
fn unwrap_single(list: &str, to: &str, strings_only: bool) -> Transform {
    let (pl, pt, fl, ft) = (list.to_string(), to.to_string(), list.to_string(), to.to_string());
    Transform::new(move |b| {
                       get_path(b, &pt).is_none()
                       && parent_is_object(b, &pt)
                       && matches!(get_path(b, &pl), Some(JsonValue::Array(items))
                                   if items.len() == 1 && wrappable(&items[0], strings_only))
                   },
                   move |b| {
                       let mut out = b.clone();
                       match remove_path(&mut out, &fl) {
                           Some(JsonValue::Array(mut items)) if items.len() == 1 => {
                               if set_path(&mut out, &ft, items.remove(0)) {
                                   out
                               } else {
                                   b.clone()
                               }
                           }
                           _ => b.clone(),
                       }
                   })
}

fn set_default(path: &str, value: JsonValue) -> Transform {
    let (pp, fp) = (path.to_string(), path.to_string());
    Transform::new(move |b| get_path(b, &pp).is_none() && parent_is_object(b, &pp),
                   move |b| {
                       let mut out = b.clone();
                       if set_path(&mut out, &fp, value.clone()) {
                           out
                       } else {
                           b.clone()
                       }
                   })
}

fn remove_default(path: &str, value: JsonValue) -> Transform {
    let (pp, fp) = (path.to_string(), path.to_string());
    Transform::new(move |b| get_path(b, &pp) == Some(&value),
                   move |b| {
                       let mut out = b.clone();
                       remove_path(&mut out, &fp);
                       out
                   })
}

fn remove_field(path: &str) -> Transform {
    let (pp, fp) = (path.to_string(), path.to_string());
    Transform::new(move |b| get_path(b, &pp).is_some(),
                   move |b| {
                       let mut out = b.clone();
                       remove_path(&mut out, &fp);
                       out
                   })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plan_file() {
        let raw = r#"{
            "name": "demo",
            "collection": "things",
            "rules": [
                {"version": 1, "name": "rename", "op": "rename_field", "from": "a", "to": "b"},
                {"version": 2, "name": "default", "op": "set_default", "path": "c.d", "value": 0}
            ]
        }"#;
        let def = PlanDefinition::from_json(raw).unwrap();
        assert_eq!(def.collection.as_deref(), Some("things"));
        assert_eq!(def.rules[0].operation,
                   FieldOperation::RenameField { from: "a".into(), to: "b".into() });
        let plan = def.into_plan().unwrap();
        assert_eq!(plan.latest_version(), 2);
    }

    #[test]
    fn rename_is_reversible() {
        let rule = RuleDefinition { version: 1,
                                    name: "r".into(),
                                    operation: FieldOperation::RenameField { from: "x.old".into(),
                                                                             to: "x.new".into() } }.compile()
                                                                                                   .unwrap();
        let samples = vec![json!({"x": {"old": 1}}), json!({"x": {"old": {"deep": true}}, "y": 2})];
        rule.check_convergence(&samples).unwrap();
        rule.check_inverse(&samples).unwrap();
    }

    fn wrap(strings_only: bool) -> TransformRule {
        RuleDefinition { version: 1,
                         name: "w".into(),
                         operation: FieldOperation::WrapInList { from: "s.t".into(),
                                                                 to: "s.ts".into(),
                                                                 strings_only } }.compile()
                                                                                 .unwrap()
    }

    #[test]
    fn wrap_in_list_leaves_existing_lists_and_nulls_alone() {
        let rule = wrap(false);
        assert!(!rule.forward().matches(&json!({"s": {"t": "02:00", "ts": ["01:00"]}})));
        assert!(!rule.forward().matches(&json!({"s": {"t": "01:00", "ts": ["01:00"]}})));
        assert!(!rule.forward().matches(&json!({"s": {"t": null}})));
        let samples = vec![json!({"s": {"t": "02:00"}}), json!({"s": {"t": [1, 2]}, "x": 1}), json!({"s": {"t": {"h": 2}}})];
        rule.check_convergence(&samples).unwrap();
        rule.check_inverse(&samples).unwrap();
    }

    #[test]
    fn wrap_in_list_strings_only_skips_other_values() {
        let rule = wrap(true);
        assert!(rule.forward().matches(&json!({"s": {"t": "02:00"}})));
        assert!(!rule.forward().matches(&json!({"s": {"t": ["02:00"]}})));
        assert!(!rule.forward().matches(&json!({"s": {"t": 2}})));
        // la inversa tampoco toca listas que no pudo producir
        assert!(!rule.backward().unwrap().matches(&json!({"s": {"ts": [["02:00"]]}})));
        assert!(rule.backward().unwrap().matches(&json!({"s": {"ts": ["02:00"]}})));
    }

    #[test]
    fn strings_only_defaults_to_false_in_plan_files() {
        let def = PlanDefinition::from_json(r#"{"name": "p", "rules": [
            {"version": 1, "name": "w", "op": "wrap_in_list", "from": "a", "to": "b"}]}"#).unwrap();
        assert_eq!(def.rules[0].operation,
                   FieldOperation::WrapInList { from: "a".into(),
                                                to: "b".into(),
                                                strings_only: false });
    }

    #[test]
    fn rename_moves_nested_values() {
        let rule = RuleDefinition { version: 1,
                                    name: "r".into(),
                                    operation: FieldOperation::RenameField { from: "a.b".into(),
                                                                             to: "c".into() } }.compile()
                                                                                               .unwrap();
        assert_eq!(rule.forward().apply(&json!({"a": {"b": 1}})), json!({"a": {}, "c": 1}));
        // destino no escribible: sin cambios
        assert!(!rule.forward().matches(&json!({"a": {"b": 1}, "c": 5})));
    }

    #[test]
    fn remove_field_has_no_inverse() {
        let rule = RuleDefinition { version: 3,
                                    name: "rm".into(),
                                    operation: FieldOperation::RemoveField { path: "legacy".into() } }.compile()
                                                                                                      .unwrap();
        assert!(rule.backward().is_none());
        assert!(rule.check_inverse(&[json!({"legacy": 1})]).is_err());
    }

    #[test]
    fn rejects_empty_path_segments() {
        let def = RuleDefinition { version: 1,
                                   name: "bad".into(),
                                   operation: FieldOperation::RemoveField { path: "a..b".into() } };
        assert!(matches!(def.compile(), Err(MigrationError::InvalidPlan(_))));
        let def = RuleDefinition { version: 1,
                                   name: "nested".into(),
                                   operation: FieldOperation::RenameField { from: "a".into(),
                                                                            to: "a.b".into() } };
        assert!(def.compile().is_err());
    }
}
