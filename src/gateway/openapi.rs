use std::sync::Arc;
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApi, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

use super::{
    handlers::{admin_status, csrf_token, health},
    state::GatewayState,
};

#[must_use]
pub fn openapi() -> OpenApi {
    let (_router, mut openapi) = gateway_router().split_for_parts();
    let (_health, health) = health_router().split_for_parts();
    openapi.merge(health);
    openapi
}

/// Routes answered before any access checks.
pub(crate) fn health_router() -> OpenApiRouter<Arc<GatewayState>> {
    OpenApiRouter::new().routes(routes!(health::health))
}

/// Gateway endpoints. They sit behind the access gate like upstream traffic.
pub(crate) fn gateway_router() -> OpenApiRouter<Arc<GatewayState>> {
    let mut router = OpenApiRouter::with_openapi(package_openapi())
        .routes(routes!(csrf_token::csrf_token))
        .routes(routes!(admin_status::admin_status))
        .routes(routes!(admin_status::refresh));

    let mut gateway = Tag::new("gateway");
    gateway.description = Some("Session helpers served by the gateway itself".to_string());
    let mut health = Tag::new("health");
    health.description = Some("Liveness check".to_string());
    router.get_openapi_mut().tags = Some(vec![gateway, health]);

    router
}

/// Document info taken from the package metadata.
fn package_openapi() -> OpenApi {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(non_empty(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = author_contact(env!("CARGO_PKG_AUTHORS"));
    info.license = non_empty(env!("CARGO_PKG_LICENSE")).map(|identifier| {
        let mut license = License::new(identifier);
        license.identifier = Some(identifier.to_string());
        license
    });

    OpenApiBuilder::new().info(info).build()
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|value| !value.is_empty())
}

/// First Cargo author, `Name <email>` or a bare name.
fn author_contact(authors: &str) -> Option<Contact> {
    let primary = non_empty(authors.split(':').next()?)?;
    let (name, email) = match primary.split_once('<') {
        Some((name, email)) => (non_empty(name), non_empty(email.trim_end_matches('>'))),
        None => (Some(primary), None),
    };
    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_every_gateway_endpoint() {
        let doc = openapi();
        for path in [
            "/health",
            "/gateway/csrf-token",
            "/gateway/admin-status",
            "/gateway/admin-status/refresh",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
        assert_eq!(doc.info.title, env!("CARGO_PKG_NAME"));
    }

    #[test]
    fn parses_author_contact() {
        let contact = author_contact("Team Storegate <team@storegate.dev>");
        assert_eq!(
            contact.as_ref().and_then(|c| c.name.as_deref()),
            Some("Team Storegate")
        );
        assert_eq!(
            contact.as_ref().and_then(|c| c.email.as_deref()),
            Some("team@storegate.dev")
        );
        assert!(author_contact("").is_none());
        let bare = author_contact("ops");
        assert_eq!(bare.as_ref().and_then(|c| c.email.as_deref()), None);
    }
}
