use serde::Deserialize;

/// Status codes after which a request is sent again.
pub fn is_retriable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 503)
}

/// How the sender reacts to a response status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseClass {
    /// All items were accepted.
    Success,
    /// Some items were rejected, see [`BackendResponse`].
    PartialSuccess,
    /// The endpoint moved.
    Redirect,
    /// The request may succeed later.
    Retriable,
    /// The items were rejected for good.
    Failure,
}

impl ResponseClass {
    /// Classifies an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            206 | 207 => Self::PartialSuccess,
            200..=299 => Self::Success,
            301 | 307 | 308 => Self::Redirect,
            status if is_retriable_status(status) => Self::Retriable,
            _ => Self::Failure,
        }
    }
}

/// An item rejected by the collector.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    /// Position of the item in the batch.
    pub index: usize,
    /// Status of this item.
    pub status_code: u16,
    /// Reason of the rejection.
    #[serde(default)]
    pub message: Option<String>,
}

/// The body of a collector response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendResponse {
    /// Number of items in the request.
    pub items_received: usize,
    /// Number of accepted items.
    pub items_accepted: usize,
    /// The rejected items.
    pub errors: Vec<ItemError>,
    /// Application id of the ingestion resource.
    pub app_id: Option<String>,
}

impl BackendResponse {
    /// Parses a response body.
    ///
    /// Returns `None` unless the body is a JSON object whose errors account for exactly the items
    /// that were not accepted.
    pub fn parse(body: &str) -> Option<Self> {
        let response = serde_json::from_str::<Self>(body).ok()?;
        response.is_consistent().then_some(response)
    }

    /// Returns `true` if every received item was accepted.
    pub fn is_full_success(&self) -> bool {
        self.items_received == self.items_accepted && self.errors.is_empty()
    }

    fn is_consistent(&self) -> bool {
        self.items_received >= self.items_accepted
            && self.items_received - self.items_accepted == self.errors.len()
    }

    /// Splits a batch of `len` items by the per-item errors.
    pub fn split(&self, len: usize) -> PartialSplit {
        let mut split = PartialSplit::default();
        let mut failed = vec![false; len];

        for error in &self.errors {
            let Some(seen) = failed.get_mut(error.index) else {
                continue;
            };
            if std::mem::replace(seen, true) {
                continue;
            }

            if is_retriable_status(error.status_code) {
                split.retry.push(error.index);
            } else {
                split.dropped.push(error.index);
            }
        }

        split.accepted = (0..len).filter(|&index| !failed[index]).collect();
        split.retry.sort_unstable();
        split.dropped.sort_unstable();
        split
    }
}

/// Batch indices grouped by their fate after a partial success.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartialSplit {
    /// Delivered items.
    pub accepted: Vec<usize>,
    /// Items to send again.
    pub retry: Vec<usize>,
    /// Items rejected for good.
    pub dropped: Vec<usize>,
}
