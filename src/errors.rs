use thiserror::Error;

/// Error taxonomy shared by the engine, the workers and the API layer.
///
/// Background workers swallow `ExternalUnavailable` and `Transient` and try
/// again on their next tick; `Integrity` halts the affected operation and is
/// logged loudly. Nothing here is allowed to kill a worker loop.
#[derive(Debug, Error)]
pub enum Error {
	#[error("invalid input: {0}")]
	InputValidation(String),

	#[error("{0} not found")]
	NotFound(String),

	#[error("conflict: {0}")]
	Conflict(String),

	#[error("unauthorized: {0}")]
	Unauthorized(String),

	#[error("forbidden: {0}")]
	Forbidden(String),

	#[error("external service unavailable: {0}")]
	ExternalUnavailable(String),

	#[error("insufficient {0}")]
	Insufficient(String),

	#[error("integrity violation: {0}")]
	Integrity(String),

	#[error("transient failure: {0}")]
	Transient(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl Error {
	pub fn validation(msg: impl Into<String>) -> Self {
		Error::InputValidation(msg.into())
	}

	/// HTTP status this error surfaces as.
	pub fn status_code(&self) -> u16 {
		match self {
			Error::InputValidation(_) => 400,
			Error::NotFound(_) => 404,
			Error::Conflict(_) => 409,
			Error::Unauthorized(_) => 401,
			Error::Forbidden(_) => 403,
			Error::ExternalUnavailable(_) => 503,
			Error::Insufficient(_) => 422,
			Error::Integrity(_) | Error::Internal(_) => 500,
			Error::Transient(_) => 504,
		}
	}
}

impl From<rusqlite::Error> for Error {
	fn from(err: rusqlite::Error) -> Self {
		match err {
			rusqlite::Error::QueryReturnedNoRows => Error::NotFound("row".to_string()),
			rusqlite::Error::SqliteFailure(e, msg)
				if e.code == rusqlite::ErrorCode::ConstraintViolation =>
			{
				Error::Conflict(msg.unwrap_or_else(|| "constraint violation".to_string()))
			},
			other => Error::Internal(other.to_string()),
		}
	}
}

impl From<reqwest::Error> for Error {
	fn from(err: reqwest::Error) -> Self {
		if err.is_timeout() {
			Error::Transient(err.to_string())
		} else {
			Error::ExternalUnavailable(err.to_string())
		}
	}
}

impl From<anyhow::Error> for Error {
	fn from(err: anyhow::Error) -> Self {
		Error::ExternalUnavailable(format!("{:#}", err))
	}
}

impl warp::reject::Reject for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn maps_statuses() {
		assert_eq!(Error::validation("x").status_code(), 400);
		assert_eq!(Error::Conflict("dup".into()).status_code(), 409);
		assert_eq!(Error::ExternalUnavailable("api".into()).status_code(), 503);
	}

	#[test]
	fn sqlite_constraint_becomes_conflict() {
		let conn = rusqlite::Connection::open_in_memory().unwrap();
		conn.execute_batch("CREATE TABLE t (x TEXT PRIMARY KEY); INSERT INTO t VALUES ('a');")
			.unwrap();
		let err = conn.execute("INSERT INTO t VALUES ('a')", []).unwrap_err();
		assert!(matches!(Error::from(err), Error::Conflict(_)));
	}
}
