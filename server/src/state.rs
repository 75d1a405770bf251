use std::sync::Arc;

use crate::hub::Hub;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Real-time fan-out hub
    pub hub: Arc<Hub>,
    /// HS256 secret shared with the auth service
    pub jwt_secret: Vec<u8>,
}
