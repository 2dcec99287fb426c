use stratus_common::{error_kind, CpiError, ErrorKind};
use stratus_providers::ApiError;

/// How the orchestrator reacts to a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFailure {
    /// Entity absent; callers take their fallback path.
    NotFound,
    /// An identical upgrade order is already open for the instance.
    UpgradePending,
    /// The target is mid-operation; retry later.
    Transient,
    Rejected,
}

const NOT_FOUND_CODES: [&str; 2] = [
    "SoftLayer_Exception_ObjectNotFound",
    "SoftLayer_Exception_NotFound",
];

pub fn classify_api(err: &ApiError) -> ProviderFailure {
    let message = err.message.to_ascii_lowercase();
    if err.status == 404 || NOT_FOUND_CODES.contains(&err.code.as_str()) {
        return ProviderFailure::NotFound;
    }
    if message.contains("a current price was provided for the upgrade order")
        || message.contains("pending upgrade")
    {
        return ProviderFailure::UpgradePending;
    }
    if err.status == 503
        || err.status == 429
        || message.contains("currently being modified")
        || message.contains("busy")
        || message.contains("try again")
    {
        return ProviderFailure::Transient;
    }
    ProviderFailure::Rejected
}

/// Classifies anything that bubbled out of a provider call. Errors that
/// already carry the taxonomy are mapped from it.
pub fn classify(err: &anyhow::Error) -> ProviderFailure {
    if let Some(api) = err.chain().find_map(|e| e.downcast_ref::<ApiError>()) {
        return classify_api(api);
    }
    match err.downcast_ref::<CpiError>().map(CpiError::kind) {
        Some(ErrorKind::NotFound) => ProviderFailure::NotFound,
        _ => ProviderFailure::Rejected,
    }
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    classify(err) == ProviderFailure::NotFound
}

/// Re-raises a provider failure under the shared taxonomy. Errors that are
/// already classified pass through untouched.
pub fn into_cpi(err: anyhow::Error, what: &str) -> anyhow::Error {
    let raw_api = err.chain().any(|e| e.is::<ApiError>());
    if !raw_api && error_kind(&err).is_some() {
        return err;
    }
    match classify(&err) {
        ProviderFailure::NotFound => err.context(CpiError::NotFound(what.to_string())),
        ProviderFailure::Rejected => err.context(CpiError::ProviderRejected(what.to_string())),
        _ => err,
    }
}
