use axum::{
    body::Body,
    http::{Response, StatusCode},
};

use crate::error::RegistryError;

pub async fn get() -> Result<Response<Body>, RegistryError> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Docker-Distribution-Api-Version", "registry/2.0")
        .body(Body::empty())?)
}
