// Archivo: service.rs
// Propósito: implementar `MigrationService`, una capa orquestadora que
// mantiene un registro de planes con nombre y delega en el motor. Es la
// capa que invocan el binario y las pruebas de extremo a extremo.
use crate::builtin::builtin_plans;
use crate::declarative::PlanDefinition;
use crate::domain::{Checkpoint, RunReport};
use crate::engine::{MigrationEngine, MigrationEngineConfig, RunFailure, RunOptions, RunResult};
use crate::errors::{MigrationError, Result};
use crate::plan::MigrationPlan;
use crate::repository::{CheckpointStore, DocumentStore};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Plan registrado con su colección por defecto.
#[derive(Debug, Clone)]
pub struct RegisteredPlan {
    pub plan: MigrationPlan,
    pub collection: Option<String>,
}

/// Servicio de alto nivel sobre el motor de migraciones.
pub struct MigrationService<D, C>
    where D: DocumentStore + ?Sized,
          C: CheckpointStore + ?Sized
{
    engine: Arc<MigrationEngine<D, C>>,
    plans: BTreeMap<String, RegisteredPlan>,
}

impl<D, C> MigrationService<D, C>
    where D: DocumentStore + ?Sized,
          C: CheckpointStore + ?Sized
{
    /// Crea el servicio inyectando ambos almacenes. El motor se construye
    /// internamente y se reusa.
    pub fn new(documents: Arc<D>, checkpoints: Arc<C>, config: MigrationEngineConfig) -> Self {
        Self { engine: Arc::new(MigrationEngine::new(documents, checkpoints, config)),
               plans: BTreeMap::new() }
    }

    pub fn engine(&self) -> Arc<MigrationEngine<D, C>> {
        self.engine.clone()
    }

    /// Registra un plan validado. Los nombres son únicos.
    pub fn register(&mut self, plan: MigrationPlan, collection: Option<String>) -> Result<()> {
        plan.validate()?;
        if self.plans.contains_key(&plan.name) {
            return Err(MigrationError::InvalidPlan(format!("el plan '{}' ya está registrado", plan.name)));
        }
        self.plans.insert(plan.name.clone(), RegisteredPlan { plan, collection });
        Ok(())
    }

    /// Compila y registra un plan declarativo. Devuelve su nombre.
    pub fn register_definition(&mut self, definition: PlanDefinition) -> Result<String> {
        let collection = definition.collection.clone();
        let plan = definition.into_plan()?;
        let name = plan.name.clone();
        self.register(plan, collection)?;
        Ok(name)
    }

    /// Registra todos los planes incluidos en el binario.
    pub fn register_builtins(&mut self) -> Result<()> {
        for builtin in builtin_plans()? {
            self.register(builtin.plan, Some(builtin.collection.to_string()))?;
        }
        Ok(())
    }

    /// Planes registrados, ordenados por nombre.
    pub fn plans(&self) -> impl Iterator<Item = &RegisteredPlan> {
        self.plans.values()
    }

    pub fn plan(&self, name: &str) -> Option<&RegisteredPlan> {
        self.plans.get(name)
    }

    pub fn run(&self, name: &str, collection: Option<&str>, batch_size: usize, options: &RunOptions) -> RunResult {
        let (plan, collection) = self.resolve(name, collection, options)?;
        self.engine.run(&plan.plan, &collection, batch_size, options)
    }

    pub fn rollback(&self,
                    name: &str,
                    collection: Option<&str>,
                    target_version: i64,
                    batch_size: usize,
                    options: &RunOptions)
                    -> RunResult {
        let (plan, collection) = self.resolve(name, collection, options)?;
        self.engine.rollback(&plan.plan, &collection, target_version, batch_size, options)
    }

    pub fn status(&self, name: &str) -> Result<Option<Checkpoint>> {
        self.engine.status(name)
    }

    pub fn history(&self, name: &str) -> Result<Vec<Checkpoint>> {
        self.engine.history(name)
    }

    /// Busca el plan y decide la colección: la explícita gana a la del plan.
    fn resolve(&self,
               name: &str,
               collection: Option<&str>,
               options: &RunOptions)
               -> std::result::Result<(&RegisteredPlan, String), RunFailure> {
        let fail = |error: MigrationError| RunFailure { report: RunReport::new(name, collection.unwrap_or_default(), options.dry_run),
                                                         error };
        let plan = self.plans
                       .get(name)
                       .ok_or_else(|| fail(MigrationError::InvalidArgument(format!("plan desconocido '{}'", name))))?;
        let collection = collection.map(str::to_string)
                                   .or_else(|| plan.collection.clone())
                                   .ok_or_else(|| {
                                       fail(MigrationError::InvalidArgument(format!("el plan '{}' no tiene colección por defecto; indique una",
                                                                                    name)))
                                   })?;
        Ok((plan, collection))
    }
}
