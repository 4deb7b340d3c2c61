// Archivo: cursor.rs
// Propósito: adaptar la primitiva `scan` del almacén a una secuencia
// perezosa, sólo hacia delante y reanudable desde un `ResumeToken`.
use crate::domain::{Document, ResumeToken};
use crate::errors::Result;
use crate::repository::DocumentStore;
use std::collections::VecDeque;

/// Cursor paginado sobre una colección.
///
/// Reanudar desde un token produce el mismo sufijo que un recorrido sin
/// interrupciones, salvo inserciones/borrados concurrentes. No reintenta:
/// los fallos del almacén se propagan al motor.
pub struct DocumentCursor<'a, D>
    where D: DocumentStore + ?Sized
{
    store: &'a D,
    collection: String,
    page_size: usize,
    /// Clave del último documento entregado.
    position: Option<ResumeToken>,
    /// Último token pedido al almacén (fin de la página en curso).
    fetched_until: Option<ResumeToken>,
    buffer: VecDeque<Document>,
    exhausted: bool,
}

impl<'a, D> DocumentCursor<'a, D> where D: DocumentStore + ?Sized
{
    /// Abre el cursor en `resume_token` (exclusive) o al principio.
    pub fn open(store: &'a D, collection: &str, resume_token: Option<ResumeToken>, page_size: usize) -> Self {
        Self { store,
               collection: collection.to_string(),
               page_size: page_size.max(1),
               fetched_until: resume_token.clone(),
               position: resume_token,
               buffer: VecDeque::new(),
               exhausted: false }
    }

    /// Siguiente documento o `None` al final de la secuencia.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<Document>> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                // la posición sólo avanza: descartar claves ya vistas
                if self.position.as_ref().is_some_and(|p| doc.id.as_str() <= p.as_str()) {
                    continue;
                }
                self.position = Some(doc.token());
                return Ok(Some(doc));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fill()?;
        }
    }

    fn fill(&mut self) -> Result<()> {
        let page = self.store.scan(&self.collection, self.fetched_until.as_ref(), self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                let last = last.token();
                if self.fetched_until.as_ref().is_some_and(|f| &last <= f) {
                    // el almacén no avanzó: no hay nada más que leer
                    self.exhausted = true;
                }
                self.fetched_until = Some(last);
            }
            None => self.exhausted = true,
        }
        self.buffer.extend(page);
        Ok(())
    }

    /// Token del último documento entregado.
    pub fn position(&self) -> Option<&ResumeToken> {
        self.position.as_ref()
    }
}
