use std::collections::BTreeMap;
use std::future::Future;

use crate::error::AppError;

/// Free-form key/value context attached to slots and log records.
pub type SlotContext = BTreeMap<String, String>;

/// Fetches the raw body of a remote data source.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// A unit of work that can be driven by the
/// [`BatchCoordinator`](crate::batch::BatchCoordinator).
///
/// The identifier shows up in the batch result and in every failure message
/// for the unit.
pub trait BatchUnit: Send {
    fn unit_id(&self) -> String;
}

impl BatchUnit for String {
    fn unit_id(&self) -> String {
        self.clone()
    }
}

impl BatchUnit for &str {
    fn unit_id(&self) -> String {
        (*self).to_string()
    }
}

macro_rules! impl_batch_unit_for_int {
    ($($t:ty),*) => {
        $(
            impl BatchUnit for $t {
                fn unit_id(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

impl_batch_unit_for_int!(u32, u64, usize, i32, i64);

/// Renders a context map as `k=v,k=v` for log fields.
pub(crate) fn context_fields(context: Option<&SlotContext>) -> String {
    context
        .map(|ctx| {
            ctx.iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}
