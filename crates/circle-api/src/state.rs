use std::sync::Arc;

use tracing::error;

use circle_db::Database;
use circle_gateway::Notifier;

use crate::error::{ApiError, ApiResult};
use crate::storage::ObjectStore;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    pub notifier: Arc<dyn Notifier>,
    pub storage: Arc<dyn ObjectStore>,
}

impl AppStateInner {
    pub fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }
}

/// Run blocking store work off the async runtime.
pub async fn blocking<F, T>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal(e.into())
    })?
}
