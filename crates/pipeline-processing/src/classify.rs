use model::records::run::FailureCategory;
use pipeline_core::retry::RetryDisposition;

/// Maps a failure category onto the retry policy's vocabulary.
///
/// `NoDataAvailable` is a timing condition: the gate will admit a later
/// trigger, so retrying in place buys nothing. `ProcessingError` and
/// `Unknown` are defects; retrying the same input reproduces them.
pub fn disposition(category: FailureCategory) -> RetryDisposition {
    match category {
        FailureCategory::UpstreamFailure | FailureCategory::Timeout => RetryDisposition::Retry,
        FailureCategory::None
        | FailureCategory::NoDataAvailable
        | FailureCategory::ProcessingError
        | FailureCategory::Unknown => RetryDisposition::Stop,
    }
}
