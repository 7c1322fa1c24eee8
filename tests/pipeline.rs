//! End-to-end evaluation: sample in, anomalies and incidents out.

mod common;

use chrono::Duration;
use uuid::Uuid;

use pulsewarden::detect::engine::Outcome;
use pulsewarden::detect::resolver::ThresholdRequest;
use pulsewarden::detect::Severity;
use pulsewarden::incident::{
    Actor, IncidentSeverity, IncidentStatus, Priority, TimelineEntryType,
};
use pulsewarden::metrics::{MetricSample, MetricType};
use pulsewarden::notify::{IncidentEventKind, NotificationDispatcher};
use pulsewarden::storage::db_now;

#[test]
fn test_error_count_breach_opens_one_incident() {
    let (notifier, mut events) = NotificationDispatcher::channel();
    let (_dir, services) = common::services_with(notifier);
    let app = Uuid::new_v4();
    let mut req = ThresholdRequest::new(Some(app), MetricType::ErrorCount);
    req.warning_threshold = Some(10.0);
    req.critical_threshold = Some(50.0);
    services.thresholds.create(&req).unwrap();

    let sample = MetricSample::new(app, MetricType::ErrorCount, 60.0).with_application_name("X");
    let eval = services.engine.evaluate_at(&sample, db_now()).unwrap();

    assert_eq!(eval.outcome, Outcome::Evaluated);
    assert_eq!(eval.anomalies.len(), 1);
    assert_eq!(eval.anomalies[0].severity, Severity::Critical);
    assert_eq!(eval.incidents.len(), 1);

    let incidents = services.incidents.list_by_application(app, 10).unwrap();
    assert_eq!(incidents.len(), 1);
    let incident = &incidents[0];
    assert_eq!(incident.severity, IncidentSeverity::Sev1);
    assert_eq!(incident.priority, Priority::P1);
    assert_eq!(incident.status, IncidentStatus::Open);
    assert_eq!(incident.incident_number, "INC-000001");

    let timeline = services.incidents.timeline(incident.id).unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].entry_type, TimelineEntryType::Created);

    let event = events.try_recv().unwrap();
    assert_eq!(event.kind, IncidentEventKind::Created);
    assert_eq!(event.incident_id, incident.id);
    assert!(events.try_recv().is_err());
}

#[test]
fn test_steady_cpu_raises_nothing() {
    let (_dir, services) = common::services();
    let app = Uuid::new_v4();
    let mut req = ThresholdRequest::new(Some(app), MetricType::CpuUsage);
    req.warning_threshold = Some(80.0);
    req.critical_threshold = Some(95.0);
    req.min_samples_required = Some(5);
    services.thresholds.create(&req).unwrap();

    let now = db_now();
    for (i, v) in [48.0, 49.0, 50.0, 51.0, 52.0].into_iter().enumerate() {
        let at = now - Duration::minutes(5 - i as i64);
        services
            .history
            .record(&MetricSample::new(app, MetricType::CpuUsage, v).at(at))
            .unwrap();
    }

    let sample = MetricSample::new(app, MetricType::CpuUsage, 50.0).at(now);
    let eval = services.engine.evaluate_at(&sample, now).unwrap();
    assert_eq!(eval.outcome, Outcome::Evaluated);
    assert_eq!(eval.results.len(), 4);
    assert!(eval.results.iter().all(|r| !r.anomaly_detected));
    let z = eval.results.iter().find_map(|r| r.z_score).unwrap();
    assert!(z.abs() < 1e-9);
    assert!(eval.anomalies.is_empty());
}

#[test]
fn test_cooldown_suppresses_then_resumes() {
    let (_dir, services) = common::services();
    let app = Uuid::new_v4();
    let start = db_now();

    let first = MetricSample::new(app, MetricType::CpuUsage, 97.0).at(start);
    assert_eq!(services.engine.evaluate_at(&first, start).unwrap().anomalies.len(), 1);

    let t1 = start + Duration::minutes(1);
    let second = MetricSample::new(app, MetricType::CpuUsage, 97.0).at(t1);
    let eval = services.engine.evaluate_at(&second, t1).unwrap();
    assert_eq!(eval.outcome, Outcome::Suppressed);
    assert!(eval.anomalies.is_empty());

    // Another key is unaffected.
    let other = MetricSample::new(app, MetricType::MemoryUsage, 97.0).at(t1);
    assert_eq!(services.engine.evaluate_at(&other, t1).unwrap().anomalies.len(), 1);

    let t5 = start + Duration::minutes(5);
    let third = MetricSample::new(app, MetricType::CpuUsage, 97.0).at(t5);
    let eval = services.engine.evaluate_at(&third, t5).unwrap();
    assert_eq!(eval.outcome, Outcome::Evaluated);
    assert_eq!(eval.anomalies.len(), 1);
}

#[test]
fn test_resolved_anomaly_no_longer_cools_down() {
    let (_dir, services) = common::services();
    let app = Uuid::new_v4();
    let now = db_now();

    let first = MetricSample::new(app, MetricType::DiskUsage, 99.0).at(now);
    let anomaly = services.engine.evaluate_at(&first, now).unwrap().anomalies.remove(0);
    services.anomalies.resolve(anomaly.id).unwrap();

    let later = now + Duration::seconds(30);
    let second = MetricSample::new(app, MetricType::DiskUsage, 99.0).at(later);
    assert_eq!(services.engine.evaluate_at(&second, later).unwrap().outcome, Outcome::Evaluated);
}

#[test]
fn test_escalation_never_duplicates() {
    let (_dir, services) = common::services();
    let sample = MetricSample::new(Uuid::new_v4(), MetricType::ErrorCount, 500.0);
    let eval = services.engine.evaluate_at(&sample, db_now()).unwrap();
    let anomaly = &eval.anomalies[0];

    assert!(services.escalation.escalate(anomaly).unwrap().is_none());
    assert!(services.escalation.sweep(&services.anomalies, 100).unwrap().is_empty());
    assert_eq!(services.incidents.list_active(10).unwrap().len(), 1);
}

#[test]
fn test_incident_lifecycle_timeline() {
    let (_dir, services) = common::services();
    let sample = MetricSample::new(Uuid::new_v4(), MetricType::ResponseTime, 7000.0);
    let incident = services
        .engine
        .evaluate_at(&sample, db_now())
        .unwrap()
        .incidents
        .remove(0);
    let operator = Actor::user(Uuid::new_v4());

    for status in [
        IncidentStatus::Acknowledged,
        IncidentStatus::Investigating,
        IncidentStatus::Acknowledged,
        IncidentStatus::Resolved,
    ] {
        services
            .incidents
            .update_status(incident.id, status, &operator, None)
            .unwrap();
    }
    services
        .incidents
        .add_comment(incident.id, "rolled back deploy", &operator)
        .unwrap();

    let current = services.incidents.get(incident.id).unwrap();
    assert_eq!(current.status, IncidentStatus::Resolved);
    assert!(current.acknowledged_at.is_some());
    assert!(current.resolved_at.is_some());
    assert_eq!(current.time_to_acknowledge_minutes, Some(0));

    let timeline = services.incidents.timeline(incident.id).unwrap();
    let kinds: Vec<_> = timeline.iter().map(|e| e.entry_type).collect();
    assert_eq!(
        kinds,
        vec![
            TimelineEntryType::Created,
            TimelineEntryType::StatusChanged,
            TimelineEntryType::StatusChanged,
            TimelineEntryType::StatusChanged,
            TimelineEntryType::StatusChanged,
            TimelineEntryType::Comment,
        ]
    );
    assert_eq!(timeline[1].user_id, operator.user_id());
}
