// Archivo: rule.rs
// Propósito: reglas de transformación versionadas (`TransformRule`) y
// utilidades para leer/escribir campos anidados por ruta con puntos.
use crate::domain::Document;
use crate::errors::{MigrationError, Result};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::sync::Arc;

/// Decide si un documento todavía necesita la transformación.
pub type Predicate = Arc<dyn Fn(&JsonValue) -> bool + Send + Sync>;
/// Función pura y determinista de un cuerpo de documento a otro.
pub type ApplyFn = Arc<dyn Fn(&JsonValue) -> JsonValue + Send + Sync>;

/// Par guardia + transformación.
#[derive(Clone)]
pub struct Transform {
    predicate: Predicate,
    apply: ApplyFn,
}

impl Transform {
    pub fn new<P, A>(predicate: P, apply: A) -> Self
        where P: Fn(&JsonValue) -> bool + Send + Sync + 'static,
              A: Fn(&JsonValue) -> JsonValue + Send + Sync + 'static
    {
        Self { predicate: Arc::new(predicate),
               apply: Arc::new(apply) }
    }

    pub fn matches(&self, body: &JsonValue) -> bool {
        (self.predicate)(body)
    }

    pub fn apply(&self, body: &JsonValue) -> JsonValue {
        (self.apply)(body)
    }

    /// Verdadero si aplicar la transformación converge para `body`, es
    /// decir, el resultado ya no satisface el predicado.
    pub fn converges(&self, body: &JsonValue) -> bool {
        !self.matches(&self.apply(body))
    }
}

/// Regla declarada, con nombre y versión, y una inversa opcional.
///
/// Invariante: `predicate(apply(d)) == false` para todo `d` con
/// `predicate(d) == true`.
#[derive(Clone)]
pub struct TransformRule {
    pub version: i64,
    pub name: String,
    forward: Transform,
    backward: Option<Transform>,
}

impl TransformRule {
    pub fn new<P, A>(version: i64, name: impl Into<String>, predicate: P, apply: A) -> Self
        where P: Fn(&JsonValue) -> bool + Send + Sync + 'static,
              A: Fn(&JsonValue) -> JsonValue + Send + Sync + 'static
    {
        Self { version,
               name: name.into(),
               forward: Transform::new(predicate, apply),
               backward: None }
    }

    /// Construye la regla a partir de transformaciones ya armadas.
    pub fn from_parts(version: i64, name: impl Into<String>, forward: Transform, backward: Option<Transform>) -> Self {
        Self { version,
               name: name.into(),
               forward,
               backward }
    }

    /// Añade la transformación inversa usada por `rollback`.
    pub fn with_backward<P, A>(mut self, predicate: P, apply: A) -> Self
        where P: Fn(&JsonValue) -> bool + Send + Sync + 'static,
              A: Fn(&JsonValue) -> JsonValue + Send + Sync + 'static
    {
        self.backward = Some(Transform::new(predicate, apply));
        self
    }

    pub fn predicate(&self, doc: &Document) -> bool {
        self.forward.matches(&doc.body)
    }

    pub fn apply(&self, doc: &Document) -> JsonValue {
        self.forward.apply(&doc.body)
    }

    pub fn forward(&self) -> &Transform {
        &self.forward
    }

    pub fn backward(&self) -> Option<&Transform> {
        self.backward.as_ref()
    }

    /// Comprueba la convergencia sobre documentos de muestra.
    pub fn check_convergence(&self, samples: &[JsonValue]) -> Result<()> {
        for (i, body) in samples.iter().enumerate() {
            if self.forward.matches(body) && !self.forward.converges(body) {
                return Err(MigrationError::RuleInvariantViolation { rule: self.name.clone(),
                                                                    version: self.version,
                                                                    document: format!("muestra #{}", i) });
            }
        }
        Ok(())
    }

    /// Comprueba que la inversa deshace la regla sobre las muestras que la
    /// regla transforma.
    pub fn check_inverse(&self, samples: &[JsonValue]) -> Result<()> {
        let backward = self.backward
                           .as_ref()
                           .ok_or_else(|| MigrationError::InvalidPlan(format!("la regla '{}' no tiene inversa", self.name)))?;
        for (i, body) in samples.iter().enumerate() {
            if !self.forward.matches(body) {
                continue;
            }
            let migrated = self.forward.apply(body);
            if !backward.matches(&migrated) || &backward.apply(&migrated) != body {
                return Err(MigrationError::InvalidPlan(format!("la inversa de '{}' no restaura la muestra #{}",
                                                               self.name, i)));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TransformRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformRule")
         .field("version", &self.version)
         .field("name", &self.name)
         .field("reversible", &self.backward.is_some())
         .finish()
    }
}

/// Valor en la ruta `a.b.c`, si existe.
pub fn get_path<'v>(body: &'v JsonValue, path: &str) -> Option<&'v JsonValue> {
    path.split('.').try_fold(body, |node, key| node.as_object()?.get(key))
}

/// Escribe `value` en la ruta, creando los objetos intermedios que falten.
/// Devuelve `false` si un tramo intermedio existe y no es un objeto.
pub fn set_path(body: &mut JsonValue, path: &str, value: JsonValue) -> bool {
    let mut keys: Vec<&str> = path.split('.').collect();
    let last = match keys.pop() {
        Some(k) => k,
        None => return false,
    };
    let mut node = body;
    for key in keys {
        let obj = match node.as_object_mut() {
            Some(o) => o,
            None => return false,
        };
        node = obj.entry(key.to_string()).or_insert_with(|| JsonValue::Object(Map::new()));
    }
    match node.as_object_mut() {
        Some(obj) => {
            obj.insert(last.to_string(), value);
            true
        }
        None => false,
    }
}

/// Verdadero si el padre de la ruta ya existe y es un objeto. Las
/// operaciones reversibles sólo escriben ahí, sin crear intermedios que la
/// inversa no sabría quitar.
pub fn parent_is_object(body: &JsonValue, path: &str) -> bool {
    match path.rsplit_once('.') {
        Some((parent, _)) => get_path(body, parent).is_some_and(JsonValue::is_object),
        None => body.is_object(),
    }
}

/// Elimina y devuelve el valor en la ruta.
pub fn remove_path(body: &mut JsonValue, path: &str) -> Option<JsonValue> {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (parent_mut(body, parent)?, last),
        None => (body, path),
    };
    parent.as_object_mut()?.remove(last)
}

fn parent_mut<'v>(body: &'v mut JsonValue, path: &str) -> Option<&'v mut JsonValue> {
    path.split('.').try_fold(body, |node, key| node.as_object_mut()?.get_mut(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_helpers_handle_nested_objects() {
        let mut body = json!({"sync_rules": {"schedule_time": "02:00"}});
        assert_eq!(get_path(&body, "sync_rules.schedule_time"), Some(&json!("02:00")));
        assert!(get_path(&body, "sync_rules.missing").is_none());
        assert!(set_path(&mut body, "sync_rules.schedule_times", json!(["02:00"])));
        assert_eq!(remove_path(&mut body, "sync_rules.schedule_time"), Some(json!("02:00")));
        assert_eq!(body, json!({"sync_rules": {"schedule_times": ["02:00"]}}));
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut body = json!({});
        assert!(set_path(&mut body, "a.b.c", json!(1)));
        assert_eq!(body, json!({"a": {"b": {"c": 1}}}));
        let mut scalar = json!({"a": 3});
        assert!(!parent_is_object(&scalar, "a.b"));
        assert!(!set_path(&mut scalar, "a.b", json!(1)));
        assert!(parent_is_object(&json!({"a": {"b": {}}}), "a.b.c"));
        assert!(!parent_is_object(&json!({"a": {}}), "a.b.c"));
        assert!(parent_is_object(&json!({}), "top"));
    }

    #[test]
    fn check_convergence_flags_non_converging_rule() {
        let rule = TransformRule::new(1, "noop", |b| get_path(b, "x").is_some(), |b| b.clone());
        let err = rule.check_convergence(&[json!({"x": 1})]).unwrap_err();
        assert!(matches!(err, MigrationError::RuleInvariantViolation { version: 1, .. }));
        // documentos que no coinciden no se evalúan
        assert!(rule.check_convergence(&[json!({"y": 1})]).is_ok());
    }
}
