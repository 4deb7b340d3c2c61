// Archivo: document_store.rs
// Propósito: `DocumentStore` sobre la tabla `documents`. Los cuerpos se
// guardan como JSON en texto y cada escritura incrementa `revision`.
use crate::pool::{map_db_err, SqlPool};
use crate::schema::documents::dsl;
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use log::debug;
use migration::{ConditionalWrite, Document, DocumentStore, ResumeToken, Result, WriteOutcome};
use serde_json::Value as JsonValue;

#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::documents)]
struct DocumentRow {
  collection: String,
  doc_key: String,
  body: String,
  revision: i64,
}

impl DocumentRow {
  fn into_document(self) -> Result<Document> {
    let body: JsonValue = serde_json::from_str(&self.body)?;
    Ok(Document::new(self.doc_key, body, self.revision))
  }
}

/// Almacén de documentos respaldado por Diesel.
#[derive(Clone)]
pub struct DieselDocumentStore {
  pool: SqlPool,
}

impl DieselDocumentStore {
  pub fn new(pool: SqlPool) -> Self {
    Self { pool }
  }

  /// Inserta o reemplaza un documento. Devuelve la nueva revisión.
  pub fn insert(&self, collection: &str, id: &str, body: &JsonValue) -> Result<i64> {
    let text = serde_json::to_string(body)?;
    let mut conn = self.pool.conn()?;
    map_db_err(conn.transaction::<_, DieselError, _>(|conn| {
                     let current = dsl::documents.filter(dsl::collection.eq(collection))
                                                 .filter(dsl::doc_key.eq(id))
                                                 .select(dsl::revision)
                                                 .first::<i64>(conn)
                                                 .optional()?;
                     match current {
                       Some(rev) => {
                         diesel::update(dsl::documents.filter(dsl::collection.eq(collection)).filter(dsl::doc_key.eq(id)))
                           .set((dsl::body.eq(&text), dsl::revision.eq(rev + 1)))
                           .execute(conn)?;
                         Ok(rev + 1)
                       }
                       None => {
                         let row = DocumentRow { collection: collection.to_string(),
                                                 doc_key: id.to_string(),
                                                 body: text.clone(),
                                                 revision: 1 };
                         diesel::insert_into(dsl::documents).values(&row).execute(conn)?;
                         Ok(1)
                       }
                     }
                   }))
  }

  pub fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
    let mut conn = self.pool.conn()?;
    let row = map_db_err(dsl::documents.filter(dsl::collection.eq(collection))
                                       .filter(dsl::doc_key.eq(id))
                                       .select(DocumentRow::as_select())
                                       .first(&mut conn)
                                       .optional())?;
    row.map(DocumentRow::into_document).transpose()
  }
}

impl DocumentStore for DieselDocumentStore {
  fn scan(&self, collection: &str, after: Option<&ResumeToken>, limit: usize) -> Result<Vec<Document>> {
    let mut conn = self.pool.conn()?;
    let mut query = dsl::documents.filter(dsl::collection.eq(collection))
                                  .select(DocumentRow::as_select())
                                  .order(dsl::doc_key.asc())
                                  .limit(limit as i64)
                                  .into_boxed();
    if let Some(token) = after {
      query = query.filter(dsl::doc_key.gt(token.as_str().to_string()));
    }
    let rows = map_db_err(query.load::<DocumentRow>(&mut conn))?;
    rows.into_iter().map(DocumentRow::into_document).collect()
  }

  fn fetch(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    let mut conn = self.pool.conn()?;
    let rows = map_db_err(dsl::documents.filter(dsl::collection.eq(collection))
                                        .filter(dsl::doc_key.eq_any(ids))
                                        .select(DocumentRow::as_select())
                                        .load::<DocumentRow>(&mut conn))?;
    rows.into_iter().map(DocumentRow::into_document).collect()
  }

  /// Todas las escrituras del lote van en una transacción; cada una es un
  /// `UPDATE ... WHERE revision = esperada`.
  fn write_batch(&self, collection: &str, writes: &[ConditionalWrite]) -> Result<Vec<WriteOutcome>> {
    let bodies = writes.iter()
                       .map(|w| serde_json::to_string(&w.body))
                       .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut conn = self.pool.conn()?;
    let outcomes = map_db_err(conn.transaction::<_, DieselError, _>(|conn| {
                                    let mut outcomes = Vec::with_capacity(writes.len());
                                    for (w, text) in writes.iter().zip(&bodies) {
                                      let target = dsl::documents.filter(dsl::collection.eq(collection))
                                                                 .filter(dsl::doc_key.eq(&w.id));
                                      let updated = diesel::update(target.clone().filter(dsl::revision.eq(w.expected_revision)))
                                        .set((dsl::body.eq(text), dsl::revision.eq(w.expected_revision + 1)))
                                        .execute(conn)?;
                                      if updated == 1 {
                                        outcomes.push(WriteOutcome::Written { new_revision: w.expected_revision + 1 });
                                        continue;
                                      }
                                      let exists = target.select(dsl::revision).first::<i64>(conn).optional()?.is_some();
                                      outcomes.push(if exists { WriteOutcome::Conflict } else { WriteOutcome::Missing });
                                    }
                                    Ok(outcomes)
                                  }))?;
    debug!("write_batch '{}': {} escrituras", collection, outcomes.len());
    Ok(outcomes)
  }
}
