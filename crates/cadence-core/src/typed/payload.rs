//! TaskPayload trait: a payload type bound to its queue.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Binds a payload type to the queue it is dispatched through.
///
/// # Example
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct FetchPage {
///     url: String,
/// }
///
/// impl TaskPayload for FetchPage {
///     const QUEUE: &'static str = "scraper.fetch";
/// }
/// ```
///
/// # Trait bounds
/// - `Serialize` / `DeserializeOwned`: the payload travels as the record's `data`.
/// - `Send + Sync + 'static`: handlers live behind `Arc` and cross tasks.
pub trait TaskPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Queue name, e.g. `scraper.fetch`.
    const QUEUE: &'static str;
}
