//! Administrative strategy operations as routed requests
//!
//! Routes mirror an HTTP surface (`GET /strategy/current` and friends) so the
//! same table can sit behind any transport; the daemon carries them over IPC.

use crate::strategy::{SearchError, StrategyManager};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum AdminRequest {
    CurrentStrategy,
    AvailableStrategies,
    SwitchStrategy { name: String },
    Stats,
    Benchmark { iterations: Option<usize> },
    AutoSelect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminResponse {
    pub status: u16,
    pub body: Value,
}

impl AdminResponse {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn failure(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl From<SearchError> for AdminResponse {
    fn from(error: SearchError) -> Self {
        let status = match &error {
            SearchError::NotFound(_)
            | SearchError::Unavailable(_)
            | SearchError::InvalidPreset(_)
            | SearchError::InvalidVectorLength { .. } => 400,
            SearchError::Busy => 409,
            SearchError::Cancelled => 503,
            SearchError::TransientFailure { .. } => 500,
        };
        Self::failure(status, error.to_string())
    }
}

pub struct AdminRouter {
    manager: Arc<StrategyManager>,
    default_iterations: usize,
}

impl AdminRouter {
    pub fn new(manager: Arc<StrategyManager>, default_iterations: usize) -> Self {
        Self {
            manager,
            default_iterations,
        }
    }

    /// Parse a method and path (with optional query string) into a request
    pub fn route(method: &str, path: &str) -> Result<AdminRequest, AdminResponse> {
        let (path, query) = path.split_once('?').unwrap_or((path, ""));
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let method = method.to_ascii_uppercase();

        let request = match (method.as_str(), segments.as_slice()) {
            ("GET", ["strategy", "current"]) => AdminRequest::CurrentStrategy,
            ("GET", ["strategy", "available"]) => AdminRequest::AvailableStrategies,
            ("GET", ["strategy", "stats"]) => AdminRequest::Stats,
            ("POST", ["strategy", "switch", name]) if !name.is_empty() => {
                AdminRequest::SwitchStrategy {
                    name: name.to_string(),
                }
            }
            ("POST", ["strategy", "benchmark"]) => AdminRequest::Benchmark {
                iterations: parse_iterations(query)?,
            },
            ("POST", ["strategy", "auto-select"]) => AdminRequest::AutoSelect,
            (_, ["strategy", "current" | "available" | "stats"])
            | (_, ["strategy", "switch", _])
            | (_, ["strategy", "benchmark" | "auto-select"]) => {
                return Err(AdminResponse::failure(405, format!("{} not allowed", method)))
            }
            _ => return Err(AdminResponse::failure(404, format!("No route for {}", path))),
        };
        Ok(request)
    }

    /// Route and handle in one step
    pub async fn dispatch(
        &self,
        method: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> AdminResponse {
        match Self::route(method, path) {
            Ok(request) => self.handle(request, cancel).await,
            Err(response) => response,
        }
    }

    pub async fn handle(&self, request: AdminRequest, cancel: &CancellationToken) -> AdminResponse {
        match request {
            AdminRequest::CurrentStrategy => to_response(&self.manager.current_strategy_info()),
            AdminRequest::AvailableStrategies => {
                let characteristics: BTreeMap<String, String> = self
                    .manager
                    .available_strategies()
                    .into_iter()
                    .map(|(name, d)| (name, d.performance_characteristics))
                    .collect();
                to_response(&characteristics)
            }
            AdminRequest::SwitchStrategy { name } => match self.manager.switch_strategy(&name) {
                Ok(descriptor) => to_response(&descriptor),
                Err(e) => e.into(),
            },
            AdminRequest::Stats => to_response(&self.manager.stats()),
            AdminRequest::Benchmark { iterations } => {
                let iterations = iterations.unwrap_or(self.default_iterations);
                match self.manager.benchmark_strategies(iterations, cancel).await {
                    Ok(report) => to_response(&report),
                    Err(e) => e.into(),
                }
            }
            AdminRequest::AutoSelect => to_response(&self.manager.auto_select_best_strategy()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BenchmarkQuery {
    iterations: Option<usize>,
}

fn parse_iterations(query: &str) -> Result<Option<usize>, AdminResponse> {
    let invalid = |detail: String| {
        AdminResponse::failure(400, format!("iterations must be a positive integer: {}", detail))
    };
    let parsed: BenchmarkQuery =
        serde_urlencoded::from_str(query).map_err(|e| invalid(e.to_string()))?;
    match parsed.iterations {
        Some(0) => Err(invalid("got 0".to_string())),
        iterations => Ok(iterations),
    }
}

fn to_response<T: Serialize>(value: &T) -> AdminResponse {
    match serde_json::to_value(value) {
        Ok(body) => AdminResponse::ok(body),
        Err(e) => AdminResponse::failure(500, format!("Failed to serialize response: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        assert_eq!(
            AdminRouter::route("GET", "/strategy/current"),
            Ok(AdminRequest::CurrentStrategy)
        );
        assert_eq!(
            AdminRouter::route("post", "/strategy/switch/GPU"),
            Ok(AdminRequest::SwitchStrategy {
                name: "GPU".to_string()
            })
        );
        assert_eq!(
            AdminRouter::route("POST", "/strategy/benchmark?iterations=25"),
            Ok(AdminRequest::Benchmark {
                iterations: Some(25)
            })
        );
        assert_eq!(
            AdminRouter::route("POST", "/strategy/benchmark"),
            Ok(AdminRequest::Benchmark { iterations: None })
        );
        assert_eq!(
            AdminRouter::route("POST", "/strategy/auto-select"),
            Ok(AdminRequest::AutoSelect)
        );
    }

    #[test]
    fn test_route_errors() {
        assert_eq!(
            AdminRouter::route("GET", "/strategy/unknown").unwrap_err().status,
            404
        );
        assert_eq!(
            AdminRouter::route("DELETE", "/strategy/current").unwrap_err().status,
            405
        );
        assert_eq!(
            AdminRouter::route("POST", "/strategy/benchmark?iterations=zero")
                .unwrap_err()
                .status,
            400
        );
        assert_eq!(
            AdminRouter::route("POST", "/strategy/benchmark?iterations=0")
                .unwrap_err()
                .status,
            400
        );
    }

    #[test]
    fn test_benchmark_query_is_percent_decoded() {
        assert_eq!(
            AdminRouter::route("POST", "/strategy/benchmark?iterations=1%30"),
            Ok(AdminRequest::Benchmark {
                iterations: Some(10)
            })
        );
        assert_eq!(
            AdminRouter::route("POST", "/strategy/benchmark?warmup=yes&iterations=4"),
            Ok(AdminRequest::Benchmark {
                iterations: Some(4)
            })
        );
        assert_eq!(
            AdminRouter::route("POST", "/strategy/benchmark?"),
            Ok(AdminRequest::Benchmark { iterations: None })
        );
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(AdminResponse::from(SearchError::Busy).status, 409);
        assert_eq!(
            AdminResponse::from(SearchError::NotFound("strategy x".into())).status,
            400
        );
        assert_eq!(
            AdminResponse::from(SearchError::Unavailable("GPU".into())).status,
            400
        );
    }
}
