pub mod admin_status;
pub mod csrf_token;
pub mod health;

use axum::Extension;
use crate::gateway::{middleware::GateContext, session::Session};

/// Session of the caller, as resolved by the gate.
pub(crate) fn caller_session(context: Option<&Extension<GateContext>>) -> Option<&Session> {
    context.and_then(|Extension(context)| context.outcome.session.as_ref())
}
