//! State shared by the HTTP handlers.

use std::sync::Arc;

use tokio::sync::watch;

use crate::allocation::Allocator;
use crate::context::Context;

/// Cheap to clone; passed to every handler through axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    ctx: Context,
    allocator: Arc<Allocator>,
    leading: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(ctx: Context, allocator: Arc<Allocator>, leading: watch::Receiver<bool>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                ctx,
                allocator,
                leading,
            }),
        }
    }

    pub fn ctx(&self) -> &Context {
        &self.inner.ctx
    }

    pub fn allocator(&self) -> &Allocator {
        &self.inner.allocator
    }

    /// Whether this process currently runs the controllers.
    pub fn is_leading(&self) -> bool {
        *self.inner.leading.borrow()
    }
}
