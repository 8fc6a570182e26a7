use http::StatusCode;
use serde_json::{Value, json};

/// Error that renders as an OpenAI-style `{"error": {...}}` body
///
/// Domain crates classify their errors through this trait; turning the
/// classification into an HTTP response is left to the handler layer.
pub trait HttpError: std::error::Error {
    fn status_code(&self) -> StatusCode;

    /// Broad category such as `upstream_error`
    fn error_type(&self) -> &str;

    /// Stable machine-readable code such as `model_not_found`
    fn error_code(&self) -> &str;

    /// Message safe to expose to API consumers
    fn client_message(&self) -> String;

    /// Extra fields merged into the error object
    fn details(&self) -> Option<Value> {
        None
    }

    fn error_body(&self) -> Value {
        let mut detail = json!({
            "message": self.client_message(),
            "type": self.error_type(),
            "code": self.error_code(),
        });

        if let (Some(Value::Object(extra)), Some(object)) = (self.details(), detail.as_object_mut()) {
            object.extend(extra);
        }

        json!({ "error": detail })
    }
}
