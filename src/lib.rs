pub mod assets;
pub mod config;
pub mod error;
pub mod extract;
pub mod matcher;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use extract::{Embedder, ExtractError, Extractor, FaceEmbedder};
pub use matcher::{find_best_match, CompareRequest, MatchError, MatchResult};
pub use server::build_router;
pub use state::AppState;
