use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use serde_json::json;

/// Boundary error taxonomy. Internal code uses `anyhow::Result`; handlers
/// translate into one of these before the response leaves the process.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
	#[error("invalid input: {0}")]
	InvalidInput(String),
	#[error("access denied: {0}")]
	AuthDenied(String),
	#[error("not found: {0}")]
	NotFound(String),
	#[error("temporary failure: {0}")]
	Transient(String),
	#[error("corrupt asset: {0}")]
	CorruptAsset(String),
	#[error("model failure: {0}")]
	ModelFailure(String),
	#[error("over capacity: {0}")]
	Capacity(String),
}

impl ApiError {
	pub fn status(&self) -> StatusCode {
		match self {
			ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
			ApiError::AuthDenied(_) => StatusCode::UNAUTHORIZED,
			ApiError::NotFound(_) => StatusCode::NOT_FOUND,
			ApiError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ApiError::CorruptAsset(_) => StatusCode::BAD_REQUEST,
			ApiError::ModelFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ApiError::Capacity(_) => StatusCode::TOO_MANY_REQUESTS,
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = self.status();
		let mut resp = (status, Json(json!({ "error": self.to_string() }))).into_response();
		if status == StatusCode::TOO_MANY_REQUESTS {
			// Devices back off linearly; spread the herd a little.
			let retry_after = rand::Rng::random_range(&mut rand::rng(), 5..=60);
			resp.headers_mut().insert(
				axum::http::header::RETRY_AFTER,
				retry_after.to_string().parse().unwrap(),
			);
		}
		resp
	}
}

impl From<anyhow::Error> for ApiError {
	fn from(err: anyhow::Error) -> Self {
		ApiError::Transient(err.to_string())
	}
}
