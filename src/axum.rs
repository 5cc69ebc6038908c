//! Axum integration utilities.

use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::action::Action;
use crate::engine::{AccessRequest, Engine, PermittedOrganizations, Scoping};
use crate::error::{Error, ErrorKind};
use crate::types::{ResourceType, UserId};

use ::axum::body::Body;
use ::axum::extract::{FromRequestParts, Query};
use ::axum::http::request::Parts;
use ::axum::http::{Request, StatusCode};
use ::axum::response::{IntoResponse, Response};
use ::tower::{Layer, Service};
use serde::Deserialize;

/// Authenticated requester attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Local user making the request.
    pub user: UserId,
}

impl AuthContext {
    pub fn new(user: UserId) -> Self {
        Self { user }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match self.kind() {
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ErrorKind::PermissionDenied => (StatusCode::FORBIDDEN, "forbidden".to_string()),
            ErrorKind::ValidationFailed | ErrorKind::TokenExpired | ErrorKind::TokenInvalid => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ErrorKind::UpstreamUnavailable => {
                tracing::warn!(error = %self, "upstream failure surfaced to client");
                (StatusCode::SERVICE_UNAVAILABLE, "upstream unavailable".to_string())
            }
            ErrorKind::Internal => {
                tracing::error!(error = %self, "internal error surfaced to client");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, message).into_response()
    }
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing auth context").into_response())
    }
}

impl<S> FromRequestParts<S> for PermittedOrganizations
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<PermittedOrganizations>()
            .cloned()
            .ok_or_else(|| {
                (StatusCode::INTERNAL_SERVER_ERROR, "authorization layer missing").into_response()
            })
    }
}

#[derive(Debug, Default, Deserialize)]
struct OrganizationQuery {
    organization_id: Option<String>,
}

/// Middleware layer computing the permitted organizations for a fixed
/// resource and action.
///
/// An `organization_id` query parameter (comma-separated) narrows the
/// result. The set is inserted into request extensions; an empty set is
/// left for the handler to turn into a not-found response.
#[derive(Debug)]
pub struct AuthorizeLayer<S> {
    engine: Arc<Engine<S>>,
    resource: ResourceType,
    action: Action,
    scoping: Scoping,
}

impl<S> Clone for AuthorizeLayer<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            resource: self.resource.clone(),
            action: self.action,
            scoping: self.scoping,
        }
    }
}

impl<S> AuthorizeLayer<S> {
    /// Creates a role-scoped authorization layer.
    pub fn new(engine: Arc<Engine<S>>, resource: ResourceType, action: Action) -> Self {
        Self {
            engine,
            resource,
            action,
            scoping: Scoping::RoleScoped,
        }
    }

    pub fn scoping(mut self, scoping: Scoping) -> Self {
        self.scoping = scoping;
        self
    }
}

impl<S, Inner> Layer<Inner> for AuthorizeLayer<S>
where
    S: crate::store::Store,
{
    type Service = AuthorizeService<Inner, S>;

    fn layer(&self, inner: Inner) -> Self::Service {
        AuthorizeService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Middleware service produced by [`AuthorizeLayer`].
#[derive(Debug)]
pub struct AuthorizeService<Inner, S> {
    inner: Inner,
    layer: AuthorizeLayer<S>,
}

impl<Inner: Clone, S> Clone for AuthorizeService<Inner, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            layer: self.layer.clone(),
        }
    }
}

impl<Inner, S> Service<Request<Body>> for AuthorizeService<Inner, S>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    S: crate::store::Store + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let layer = self.layer.clone();

        Box::pin(async move {
            let Some(context) = req.extensions().get::<AuthContext>().cloned() else {
                return Ok((StatusCode::UNAUTHORIZED, "missing auth context").into_response());
            };

            let request = match access_request(&layer, context.user, req.uri()) {
                Ok(request) => request,
                Err(err) => return Ok(err.into_response()),
            };

            match layer.engine.permitted_organizations(&request).await {
                Ok(permitted) => {
                    req.extensions_mut().insert(permitted);
                    poll_fn(|cx| inner.poll_ready(cx)).await?;
                    inner.call(req).await
                }
                Err(err) => Ok(err.into_response()),
            }
        })
    }
}

fn access_request<S>(
    layer: &AuthorizeLayer<S>,
    user: UserId,
    uri: &::axum::http::Uri,
) -> crate::error::Result<AccessRequest> {
    let request = AccessRequest::new(user, layer.resource.clone(), layer.action)
        .scoping(layer.scoping);
    let query = Query::<OrganizationQuery>::try_from_uri(uri)
        .map(|Query(query)| query)
        .unwrap_or_default();
    match query.organization_id {
        Some(raw) => request.filter_str(&raw),
        None => Ok(request),
    }
}

#[cfg(feature = "axum-jwt")]
pub mod jwt {
    //! Bearer-token authentication against identity-provider JWTs.

    use std::fmt;
    use std::future::poll_fn;
    use std::marker::PhantomData;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};

    use jsonwebtoken::{DecodingKey, Validation, decode};
    use serde::de::DeserializeOwned;
    use thiserror::Error;

    use crate::axum::AuthContext;
    use crate::store::UserStore;
    use crate::types::ExternalId;

    use ::axum::body::Body;
    use ::axum::http::header::AUTHORIZATION;
    use ::axum::http::{HeaderMap, Request, StatusCode};
    use ::axum::response::{IntoResponse, Response};
    use ::tower::{Layer, Service};

    /// Errors returned by JWT auth helpers.
    #[derive(Debug, Error)]
    pub enum AuthError {
        #[error("missing authorization header")]
        MissingAuthorization,
        #[error("invalid authorization header")]
        InvalidAuthorization,
        #[error("invalid token")]
        InvalidToken,
        /// Subject does not map to an active local user.
        #[error("unknown user")]
        UnknownUser,
        #[error("user lookup failed")]
        Lookup,
    }

    impl IntoResponse for AuthError {
        fn into_response(self) -> Response {
            let status = match self {
                Self::Lookup => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::UNAUTHORIZED,
            };
            (status, self.to_string()).into_response()
        }
    }

    /// Claims carrying the identity-provider subject.
    pub trait JwtClaims: DeserializeOwned + Send + Sync + Clone + 'static {
        fn subject(&self) -> &str;
    }

    /// Default claims shape: `{ sub, email, exp }`.
    #[derive(Debug, Clone, serde::Deserialize)]
    pub struct IdentityClaims {
        pub sub: String,
        pub email: Option<String>,
        pub exp: Option<usize>,
    }

    impl JwtClaims for IdentityClaims {
        fn subject(&self) -> &str {
            &self.sub
        }
    }

    /// Decoding settings for identity-provider tokens.
    #[derive(Clone)]
    pub struct JwtAuthState<C: JwtClaims> {
        decoding_key: Arc<DecodingKey>,
        validation: Validation,
        _marker: PhantomData<fn() -> C>,
    }

    impl<C: JwtClaims> fmt::Debug for JwtAuthState<C> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("JwtAuthState")
                .field("decoding_key", &"<redacted>")
                .field("validation", &self.validation)
                .finish()
        }
    }

    impl<C: JwtClaims> JwtAuthState<C> {
        pub fn new(decoding_key: DecodingKey, validation: Validation) -> Self {
            Self {
                decoding_key: Arc::new(decoding_key),
                validation,
                _marker: PhantomData,
            }
        }

        fn decode_from_headers(&self, headers: &HeaderMap) -> Result<C, AuthError> {
            let token = bearer_token(headers)?;
            decode::<C>(token, &self.decoding_key, &self.validation)
                .map(|data| data.claims)
                .map_err(|_| AuthError::InvalidToken)
        }
    }

    /// Layer that authenticates bearer tokens and attaches [`AuthContext`]
    /// for the active local user owning the token subject.
    pub struct JwtAuthLayer<C: JwtClaims, U> {
        state: Arc<JwtAuthState<C>>,
        users: Arc<U>,
    }

    impl<C: JwtClaims, U> Clone for JwtAuthLayer<C, U> {
        fn clone(&self) -> Self {
            Self {
                state: self.state.clone(),
                users: self.users.clone(),
            }
        }
    }

    impl<C: JwtClaims, U> JwtAuthLayer<C, U> {
        pub fn new(state: JwtAuthState<C>, users: Arc<U>) -> Self {
            Self {
                state: Arc::new(state),
                users,
            }
        }
    }

    impl<S, C, U> Layer<S> for JwtAuthLayer<C, U>
    where
        C: JwtClaims,
    {
        type Service = JwtAuthService<S, C, U>;

        fn layer(&self, inner: S) -> Self::Service {
            JwtAuthService {
                inner,
                layer: self.clone(),
            }
        }
    }

    /// Middleware service produced by [`JwtAuthLayer`].
    pub struct JwtAuthService<S, C: JwtClaims, U> {
        inner: S,
        layer: JwtAuthLayer<C, U>,
    }

    impl<S: Clone, C: JwtClaims, U> Clone for JwtAuthService<S, C, U> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
                layer: self.layer.clone(),
            }
        }
    }

    impl<S, C, U> Service<Request<Body>> for JwtAuthService<S, C, U>
    where
        S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
        S::Future: Send + 'static,
        C: JwtClaims,
        U: UserStore + Send + Sync + 'static,
    {
        type Response = Response;
        type Error = S::Error;
        type Future =
            Pin<Box<dyn std::future::Future<Output = Result<Response, Self::Error>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, mut req: Request<Body>) -> Self::Future {
            let layer = self.layer.clone();
            let mut inner = self.inner.clone();

            Box::pin(async move {
                let claims = match layer.state.decode_from_headers(req.headers()) {
                    Ok(claims) => claims,
                    Err(err) => return Ok(err.into_response()),
                };
                let context = match resolve(layer.users.as_ref(), claims.subject()).await {
                    Ok(context) => context,
                    Err(err) => return Ok(err.into_response()),
                };
                req.extensions_mut().insert(context);
                req.extensions_mut().insert(claims);
                poll_fn(|cx| inner.poll_ready(cx)).await?;
                inner.call(req).await
            })
        }
    }

    async fn resolve<U: UserStore>(users: &U, subject: &str) -> Result<AuthContext, AuthError> {
        let external_id = ExternalId::new(subject).map_err(|_| AuthError::InvalidToken)?;
        let user = users
            .user_by_external_id(&external_id)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "user lookup failed during authentication");
                AuthError::Lookup
            })?;
        match user {
            Some(user) if user.is_active => Ok(AuthContext::new(user.id)),
            _ => {
                tracing::debug!(subject, "token subject has no active user");
                Err(AuthError::UnknownUser)
            }
        }
    }

    fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
        let value = headers
            .get(AUTHORIZATION)
            .ok_or(AuthError::MissingAuthorization)?;
        let value = value
            .to_str()
            .map_err(|_| AuthError::InvalidAuthorization)?;
        let token = value
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidAuthorization)?;
        if token.is_empty() {
            return Err(AuthError::InvalidAuthorization);
        }
        Ok(token)
    }
}
