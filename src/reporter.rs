use crate::agent::AgentContext;
use crate::backend::{IssueReport, LocationReport};
use crate::notify::NotificationLevel;
use crate::types::{LastKnownLocation, PositionSample};
use tokio::task::JoinHandle;

const REPORT_FAILED: &str = "Failed to update location";
const REPORT_NETWORK_ERROR: &str = "Network error. Location not saved.";

/// Pushes every sample to the backend exactly once.
///
/// Reports are fire-and-forget: nothing is retried and nothing orders two
/// in-flight reports, so a slow request can land after a newer one. With
/// `sequence_reports` enabled each report carries an increasing `sequence`
/// the backend can use to discard stale updates.
pub struct LocationReporter {
    sequence_reports: bool,
    next_sequence: u64,
}

impl LocationReporter {
    pub fn new(sequence_reports: bool) -> Self {
        LocationReporter {
            sequence_reports,
            next_sequence: 0,
        }
    }

    pub fn report(&mut self, ctx: &AgentContext, sample: &PositionSample) -> JoinHandle<()> {
        let sequence = if self.sequence_reports {
            self.next_sequence += 1;
            Some(self.next_sequence)
        } else {
            None
        };
        let report = LocationReport::from_sample(sample, sequence);
        let ctx = ctx.clone();

        tokio::spawn(async move {
            match ctx.backend.report_location(&ctx.bus_id, &report).await {
                Ok(response) if response.success => {
                    log::debug!("[reporter] location accepted ({}, {})", report.latitude, report.longitude);
                }
                Ok(response) => {
                    let message = response.error_or(REPORT_FAILED);
                    log::error!("[reporter] location rejected: {}", message);
                    ctx.notifier.notify(&message, NotificationLevel::Warning, false);
                }
                Err(e) => {
                    log::error!("[reporter] error sending location: {}", e);
                    ctx.notifier
                        .notify(REPORT_NETWORK_ERROR, NotificationLevel::Warning, false);
                }
            }
        })
    }
}

/// Send a free-text issue report tagged with the last known location.
/// Blank descriptions are ignored.
pub fn report_issue(
    ctx: &AgentContext,
    issue: &str,
    location: Option<LastKnownLocation>,
) -> Option<JoinHandle<()>> {
    let issue = issue.trim();
    if issue.is_empty() {
        return None;
    }

    let report = IssueReport {
        bus_id: ctx.bus_id.clone(),
        issue: issue.to_string(),
        location,
    };
    let ctx = ctx.clone();

    Some(tokio::spawn(async move {
        match ctx.backend.report_issue(&report).await {
            Ok(response) if response.success => {
                ctx.notifier
                    .notify("Issue reported successfully", NotificationLevel::Success, false);
            }
            Ok(response) => {
                ctx.notifier.notify(
                    &response.error_or("Failed to report issue"),
                    NotificationLevel::Danger,
                    false,
                );
            }
            Err(e) => {
                log::error!("[reporter] error reporting issue: {}", e);
                ctx.notifier
                    .notify("Failed to report issue", NotificationLevel::Danger, false);
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ApiResponse;
    use crate::testing::{BackendCall, MockBackend};
    use crate::types::{RawFix, SpeedBucket};
    use approx::assert_relative_eq;
    use chrono::Utc;
    use std::sync::Arc;

    fn sample(speed_mps: f64) -> PositionSample {
        PositionSample::from_fix(
            &RawFix {
                latitude: 1.0,
                longitude: 2.0,
                speed_mps: Some(speed_mps),
                accuracy_meters: 5.0,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_report_sends_normalized_sample() {
        let backend = Arc::new(MockBackend::new());
        let (ctx, _events, notifier) = AgentContext::for_test_with_backend(backend.clone());
        let mut reporter = LocationReporter::new(false);

        let fix = sample(20.0);
        assert_eq!(fix.speed_bucket(), SpeedBucket::Warning);
        reporter.report(&ctx, &fix).await.unwrap();

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            BackendCall::ReportLocation { bus_id, report } => {
                assert_eq!(bus_id, "test-bus");
                assert_eq!(report.latitude, 1.0);
                assert_eq!(report.longitude, 2.0);
                assert_relative_eq!(report.speed, 72.0, epsilon = 1e-9);
                assert_eq!(report.accuracy, 5.0);
                assert_eq!(report.timestamp, fix.timestamp);
                assert_eq!(report.sequence, None);
            }
            other => panic!("unexpected call {:?}", other),
        }
        assert!(notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_report_warns_with_server_message() {
        let backend = Arc::new(MockBackend::new());
        backend.set_location_response(Some(ApiResponse::failed("Bus is not on a trip")));
        let (ctx, _events, notifier) = AgentContext::for_test_with_backend(backend.clone());

        LocationReporter::new(false).report(&ctx, &sample(3.0)).await.unwrap();

        let notices = notifier.messages();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].message, "Bus is not on a trip");
        assert_eq!(notices[0].level, NotificationLevel::Warning);
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_retried() {
        let backend = Arc::new(MockBackend::new());
        backend.set_location_response(None);
        let (ctx, _events, notifier) = AgentContext::for_test_with_backend(backend.clone());

        LocationReporter::new(false).report(&ctx, &sample(3.0)).await.unwrap();

        assert_eq!(backend.calls().len(), 1);
        assert_eq!(notifier.count_containing("Network error"), 1);
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase() {
        let backend = Arc::new(MockBackend::new());
        let (ctx, _events, _notifier) = AgentContext::for_test_with_backend(backend.clone());
        let mut reporter = LocationReporter::new(true);

        reporter.report(&ctx, &sample(1.0)).await.unwrap();
        reporter.report(&ctx, &sample(2.0)).await.unwrap();

        let sequences: Vec<Option<u64>> = backend
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::ReportLocation { report, .. } => Some(report.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn test_blank_issue_ignored() {
        let backend = Arc::new(MockBackend::new());
        let (ctx, _events, _notifier) = AgentContext::for_test_with_backend(backend.clone());

        assert!(report_issue(&ctx, "   ", None).is_none());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_issue_carries_location() {
        let backend = Arc::new(MockBackend::new());
        let (ctx, _events, notifier) = AgentContext::for_test_with_backend(backend.clone());
        let location = sample(0.0).last_known();

        report_issue(&ctx, "Flat tyre", Some(location.clone()))
            .unwrap()
            .await
            .unwrap();

        match &backend.calls()[0] {
            BackendCall::ReportIssue(report) => {
                assert_eq!(report.issue, "Flat tyre");
                assert_eq!(report.location.as_ref(), Some(&location));
            }
            other => panic!("unexpected call {:?}", other),
        }
        assert_eq!(notifier.count_containing("Issue reported successfully"), 1);
    }
}
