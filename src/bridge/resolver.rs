use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::error::AtomError;
use crate::query::{QueryOptions, ThrowOnError};
use crate::store::Getter;

/// Produces a cell's options; may read atoms.
pub type OptionsFn<O> = Arc<dyn Fn(&Getter<'_>) -> Result<O, AtomError> + Send + Sync>;

/// Boxes an options function.
pub fn options_fn<O, F>(f: F) -> OptionsFn<O>
where
    F: Fn(&Getter<'_>) -> Result<O, AtomError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Stale time of suspending queries that do not set one, so the refetch after
/// a suspension does not start right away.
pub const SUSPENSE_STALE_TIME: Duration = Duration::from_secs(1);

/// Which errors a variant throws, regardless of the caller's options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThrowPolicy {
    /// Use the caller's `throw_on_error`.
    Options,
    /// Throw only while the query has no data to show.
    WhenNoData,
    Never,
}

/// The knobs by which the query variants differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VariantPolicy {
    pub suspense: Option<bool>,
    pub force_enabled: bool,
    pub throw: ThrowPolicy,
    /// An errored query is not refetched on mount until the error is reset.
    pub keep_errors: bool,
}

impl VariantPolicy {
    /// Status values, no suspending and no throwing unless asked to.
    pub const QUERY: Self = Self {
        suspense: None,
        force_enabled: false,
        throw: ThrowPolicy::Options,
        keep_errors: false,
    };

    /// Suspends while pending and throws while there is no data.
    pub const SUSPENSE: Self = Self {
        suspense: Some(true),
        force_enabled: true,
        throw: ThrowPolicy::WhenNoData,
        keep_errors: true,
    };

    /// Every snapshot as is. The paired data cell throws instead.
    pub const STATUS: Self = Self {
        suspense: Some(false),
        force_enabled: false,
        throw: ThrowPolicy::Never,
        keep_errors: true,
    };
}

/// Applies the variant's policy to the caller's options.
///
/// `is_reset` is the error-reset flag. Unless it is set, a variant that
/// suspends or throws, or that keeps errors, does not refetch an errored
/// query on mount, so the error stays observable.
pub(crate) fn resolve_options<T>(options: &mut QueryOptions<T>, policy: VariantPolicy, is_reset: bool)
where
    T: Clone + Send + Sync + 'static,
{
    if let Some(suspense) = policy.suspense {
        options.suspense = suspense;
    }
    if policy.force_enabled {
        options.enabled = true;
    }
    match policy.throw {
        ThrowPolicy::Options => {}
        ThrowPolicy::WhenNoData => {
            options.throw_on_error = ThrowOnError::when(|_, query| query.state().data.is_none());
        }
        ThrowPolicy::Never => options.throw_on_error = ThrowOnError::Never,
    }
    if options.suspense {
        options.stale_time.get_or_insert(SUSPENSE_STALE_TIME);
    }

    let throws = !matches!(options.throw_on_error, ThrowOnError::Never);
    if (policy.keep_errors || options.suspense || throws) && !is_reset {
        options.retry_on_mount = false;
    }
    trace!(
        query = %options.query_hash(),
        suspense = options.suspense,
        enabled = options.enabled,
        retry_on_mount = options.retry_on_mount,
        "options resolved"
    );
}
