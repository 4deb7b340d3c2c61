// Archivo: builtin.rs
// Propósito: planes incluidos en el binario. El primero reemplaza el script
// que convertía `sync_rules.schedule_time` en `sync_rules.schedule_times`
// en la colección `syncerconf`.
use crate::declarative::{FieldOperation, PlanDefinition, RuleDefinition};
use crate::errors::Result;
use crate::plan::MigrationPlan;

/// Plan incluido junto con su colección por defecto.
#[derive(Debug, Clone)]
pub struct BuiltinPlan {
    pub plan: MigrationPlan,
    pub collection: &'static str,
    pub description: &'static str,
}

pub const SCHEDULE_TIMES_PLAN: &str = "syncerconf-schedule-times";

/// Definición declarativa del plan `syncerconf-schedule-times`.
pub fn schedule_times_definition() -> PlanDefinition {
    PlanDefinition { name: SCHEDULE_TIMES_PLAN.into(),
                     collection: Some("syncerconf".into()),
                     rules: vec![RuleDefinition { version: 1,
                                                  name: "schedule-time-to-list".into(),
                                                  operation: FieldOperation::WrapInList { from: "sync_rules.schedule_time".into(),
                                                                                          to: "sync_rules.schedule_times".into(),
                                                                                          strings_only: true } }] }
}

/// Todos los planes incluidos, compilados y validados.
pub fn builtin_plans() -> Result<Vec<BuiltinPlan>> {
    Ok(vec![BuiltinPlan { plan: schedule_times_definition().into_plan()?,
                          collection: "syncerconf",
                          description: "mueve la cadena sync_rules.schedule_time a la lista sync_rules.schedule_times" }])
}

/// Busca un plan incluido por nombre.
pub fn builtin_plan(name: &str) -> Result<Option<BuiltinPlan>> {
    Ok(builtin_plans()?.into_iter().find(|b| b.plan.name == name))
}
