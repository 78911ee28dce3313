//! Lag feature projection over an entity history index.
//!
//! [`project`] is a pure function of `(event, index, config)`. The `augment_*`
//! drivers wrap it into a batch run: validate config against the observed
//! schema, parse raw records, build the index once, project every accepted
//! target event, and report rejections in aggregate.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::{LagConfig, LagConfigError, TransformRule, ValidatedLagConfig};
use crate::event::{
    observed_attributes, parse_events, AttrValue, Event, EventOrigin, MalformedEventError,
    RawEvent,
};
use crate::history::{partition_of, EntityHistoryIndex};

/// Output slot identity: `(source_attribute, rank)`, rank 1 = most recent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LagKey {
    pub attribute: String,
    pub rank: usize,
}

impl LagKey {
    pub fn new(attribute: impl Into<String>, rank: usize) -> Self {
        Self {
            attribute: attribute.into(),
            rank,
        }
    }

    pub fn column_name(&self) -> String {
        format!("past_{}_{}", self.attribute, self.rank)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AugmentedEvent {
    pub event: Event,
    /// Holds every `(attribute, rank)` of the config; `None` is missing.
    pub lag_attributes: BTreeMap<LagKey, Option<AttrValue>>,
}

impl AugmentedEvent {
    pub fn lag(&self, attribute: &str, rank: usize) -> Option<&AttrValue> {
        self.lag_attributes
            .get(&LagKey::new(attribute, rank))
            .and_then(Option::as_ref)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagColumn {
    pub name: String,
    pub attribute: String,
    pub rank: usize,
    pub rule: TransformRule,
}

impl LagColumn {
    pub fn key(&self) -> LagKey {
        LagKey::new(self.attribute.clone(), self.rank)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagSchema {
    pub version: u32,
    pub fingerprint: String,
    pub lookback_count: usize,
    pub columns: Vec<LagColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AugmentationReport {
    pub input_events: u64,
    pub history_events: u64,
    pub output_events: u64,
    pub rejected_events: u64,
    pub entity_count: u64,
    pub first_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AugmentationRun {
    pub schema: LagSchema,
    pub augmented: Vec<AugmentedEvent>,
    pub rejected: Vec<MalformedEventError>,
    pub report: AugmentationReport,
}

/// Columns are rank-major: every attribute for rank 1, then rank 2, ...
pub fn build_lag_schema(cfg: &ValidatedLagConfig) -> LagSchema {
    let mut columns = Vec::with_capacity(cfg.lookback_count() * cfg.attributes().len());
    for rank in 1..=cfg.lookback_count() {
        for (attribute, rule) in cfg.attributes() {
            columns.push(LagColumn {
                name: LagKey::new(attribute.clone(), rank).column_name(),
                attribute: attribute.clone(),
                rank,
                rule: *rule,
            });
        }
    }

    let fingerprint = schema_fingerprint(cfg, &columns);

    info!(
        component = "projector",
        event = "lag.schema.built",
        version = cfg.schema_version(),
        lookback_count = cfg.lookback_count(),
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    LagSchema {
        version: cfg.schema_version(),
        fingerprint,
        lookback_count: cfg.lookback_count(),
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &LagSchema,
) -> Result<(), LagConfigError> {
    if expected_version != actual.version {
        return Err(LagConfigError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(LagConfigError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

pub fn project(
    event: &Event,
    index: &EntityHistoryIndex<'_>,
    cfg: &ValidatedLagConfig,
) -> AugmentedEvent {
    let priors = index.query(&event.entity_key, event.timestamp, cfg.lookback_count());

    let mut lag_attributes = BTreeMap::new();
    for rank in 1..=cfg.lookback_count() {
        let prior = priors.get(rank - 1).copied();
        for (attribute, rule) in cfg.attributes() {
            let value = prior.and_then(|prior| {
                lag_value(*rule, event.attribute(attribute), prior.attribute(attribute))
            });
            lag_attributes.insert(LagKey::new(attribute.clone(), rank), value);
        }
    }

    AugmentedEvent {
        event: event.clone(),
        lag_attributes,
    }
}

/// Projects `targets` in order, fanning out over rayon when the config asks.
pub fn project_batch(
    targets: &[Event],
    index: &EntityHistoryIndex<'_>,
    cfg: &ValidatedLagConfig,
) -> Vec<AugmentedEvent> {
    if cfg.parallel() {
        targets
            .par_iter()
            .map(|event| project(event, index, cfg))
            .collect()
    } else {
        targets
            .iter()
            .map(|event| project(event, index, cfg))
            .collect()
    }
}

/// One collection serves as both history and targets.
pub fn augment_events(
    raw: Vec<RawEvent>,
    cfg: &LagConfig,
) -> Result<AugmentationRun, LagConfigError> {
    let validated = validate_for_input(cfg, &[&raw])?;
    let schema = build_lag_schema(&validated);
    let input_events = raw.len();
    log_run_start("single", input_events, &validated);

    let (events, rejected) = parse_events(raw, EventOrigin::Target);
    log_rejections(&rejected);

    let index = EntityHistoryIndex::build(&events);
    let augmented = project_batch(limit_targets(&events, &validated), &index, &validated);

    Ok(finish_run(
        schema,
        augmented,
        rejected,
        input_events,
        index.event_count(),
        index.entity_count(),
    ))
}

/// Targets are looked up against a separately supplied reference history.
/// Targets only contribute to the index if they are also part of `history`.
pub fn augment_against_history(
    targets: Vec<RawEvent>,
    history: Vec<RawEvent>,
    cfg: &LagConfig,
) -> Result<AugmentationRun, LagConfigError> {
    let validated = validate_for_input(cfg, &[&targets, &history])?;
    let schema = build_lag_schema(&validated);
    let input_events = targets.len();
    log_run_start("reference_history", input_events, &validated);

    let (target_events, mut rejected) = parse_events(targets, EventOrigin::Target);
    let (history_events, history_rejected) = parse_events(history, EventOrigin::History);
    rejected.extend(history_rejected);
    log_rejections(&rejected);

    let index = EntityHistoryIndex::build(&history_events);
    let augmented = project_batch(
        limit_targets(&target_events, &validated),
        &index,
        &validated,
    );

    Ok(finish_run(
        schema,
        augmented,
        rejected,
        input_events,
        index.event_count(),
        index.entity_count(),
    ))
}

/// Same output as [`augment_events`], but only one entity partition is
/// indexed at a time.
pub fn augment_partitioned(
    raw: Vec<RawEvent>,
    cfg: &LagConfig,
    partitions: usize,
) -> Result<AugmentationRun, LagConfigError> {
    if partitions == 0 {
        return Err(LagConfigError::InvalidConfig(
            "partitions must be > 0".to_string(),
        ));
    }
    let validated = validate_for_input(cfg, &[&raw])?;
    let schema = build_lag_schema(&validated);
    let input_events = raw.len();
    log_run_start("partitioned", input_events, &validated);

    let (events, rejected) = parse_events(raw, EventOrigin::Target);
    log_rejections(&rejected);

    let targets = limit_targets(&events, &validated);
    let assignments: Vec<usize> = targets
        .iter()
        .map(|event| partition_of(&event.entity_key, partitions))
        .collect();

    let mut slots: Vec<Option<AugmentedEvent>> = vec![None; targets.len()];
    let mut history_events = 0usize;
    let mut entity_count = 0usize;
    for partition in 0..partitions {
        let index = EntityHistoryIndex::build_partition(&events, partition, partitions);
        history_events += index.event_count();
        entity_count += index.entity_count();

        let members: Vec<usize> = assignments
            .iter()
            .enumerate()
            .filter(|(_, assigned)| **assigned == partition)
            .map(|(position, _)| position)
            .collect();
        let projected: Vec<(usize, AugmentedEvent)> = if validated.parallel() {
            members
                .par_iter()
                .map(|&position| (position, project(&targets[position], &index, &validated)))
                .collect()
        } else {
            members
                .iter()
                .map(|&position| (position, project(&targets[position], &index, &validated)))
                .collect()
        };
        for (position, augmented) in projected {
            slots[position] = Some(augmented);
        }
    }

    let augmented = slots.into_iter().flatten().collect();

    Ok(finish_run(
        schema,
        augmented,
        rejected,
        input_events,
        history_events,
        entity_count,
    ))
}

fn lag_value(
    rule: TransformRule,
    current: Option<&AttrValue>,
    prior: Option<&AttrValue>,
) -> Option<AttrValue> {
    match rule {
        TransformRule::Copy => prior.cloned(),
        TransformRule::EqualityFlag => match (current, prior) {
            (Some(current), Some(prior)) => Some(AttrValue::Int(i64::from(current == prior))),
            _ => None,
        },
    }
}

/// Empty input has no schema to check attributes against.
fn validate_for_input(
    cfg: &LagConfig,
    collections: &[&Vec<RawEvent>],
) -> Result<ValidatedLagConfig, LagConfigError> {
    if collections.iter().all(|records| records.is_empty()) {
        return cfg.validate();
    }
    let schema = observed_attributes(collections.iter().flat_map(|records| records.iter()));
    cfg.validate_against_schema(&schema)
}

fn limit_targets<'e>(events: &'e [Event], cfg: &ValidatedLagConfig) -> &'e [Event] {
    match cfg.max_events() {
        Some(max) => &events[..max.min(events.len())],
        None => events,
    }
}

fn finish_run(
    schema: LagSchema,
    augmented: Vec<AugmentedEvent>,
    rejected: Vec<MalformedEventError>,
    input_events: usize,
    history_events: usize,
    entity_count: usize,
) -> AugmentationRun {
    let report = AugmentationReport {
        input_events: input_events as u64,
        history_events: history_events as u64,
        output_events: augmented.len() as u64,
        rejected_events: rejected.len() as u64,
        entity_count: entity_count as u64,
        first_error: rejected.first().map(ToString::to_string),
    };

    info!(
        component = "projector",
        event = "lag.run.finish",
        input_events = report.input_events,
        history_events = report.history_events,
        output_events = report.output_events,
        rejected_events = report.rejected_events,
        entity_count = report.entity_count
    );

    AugmentationRun {
        schema,
        augmented,
        rejected,
        report,
    }
}

fn log_run_start(mode: &str, input_events: usize, cfg: &ValidatedLagConfig) {
    info!(
        component = "projector",
        event = "lag.run.start",
        mode,
        input_events = input_events,
        lookback_count = cfg.lookback_count(),
        source_attributes = cfg.attributes().len(),
        max_events = ?cfg.max_events(),
        parallel = cfg.parallel()
    );
}

fn log_rejections(rejected: &[MalformedEventError]) {
    for err in rejected {
        warn!(
            component = "projector",
            event = "lag.event.rejected",
            origin = err.origin.as_str(),
            position = err.position,
            entity_key = %err.entity_key,
            reason = %err.reason
        );
    }
}

fn schema_fingerprint(cfg: &ValidatedLagConfig, columns: &[LagColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version()));
    hasher.update(format!("lookback_count:{};", cfg.lookback_count()));
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":");
        hasher.update(column.rule.as_str());
        hasher.update(";");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Attributes;
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn event(key: &str, day: u32, handler: Option<&str>) -> Event {
        let mut attributes = Attributes::new();
        attributes.insert(
            "handler".to_string(),
            handler.map(|h| AttrValue::Text(h.to_string())),
        );
        Event::new(key, at(day), attributes)
    }

    #[test]
    fn equality_flag_needs_both_sides() {
        let x = AttrValue::Text("X".to_string());
        let y = AttrValue::Text("Y".to_string());
        let flag = TransformRule::EqualityFlag;

        assert_eq!(lag_value(flag, Some(&x), Some(&x)), Some(AttrValue::Int(1)));
        assert_eq!(lag_value(flag, Some(&x), Some(&y)), Some(AttrValue::Int(0)));
        assert_eq!(lag_value(flag, None, Some(&y)), None);
        assert_eq!(lag_value(flag, Some(&x), None), None);
        assert_eq!(lag_value(TransformRule::Copy, None, Some(&y)), Some(y.clone()));
        assert_eq!(lag_value(TransformRule::Copy, Some(&x), None), None);
    }

    #[test]
    fn equality_is_type_sensitive() {
        let flag = TransformRule::EqualityFlag;
        assert_eq!(
            lag_value(flag, Some(&AttrValue::Int(1)), Some(&AttrValue::Float(1.0))),
            Some(AttrValue::Int(0))
        );
    }

    #[test]
    fn every_slot_is_present_even_when_missing() {
        let events = vec![event("A", 1, Some("X")), event("A", 2, None)];
        let index = EntityHistoryIndex::build(&events);
        let cfg = LagConfig::new(["handler"])
            .with_rule("handler", TransformRule::EqualityFlag)
            .with_lookback(3)
            .validate()
            .unwrap();

        let out = project(&events[1], &index, &cfg);
        assert_eq!(out.lag_attributes.len(), 3);
        assert!(out.lag_attributes.values().all(Option::is_none));
        assert_eq!(out.event, events[1]);
    }

    #[test]
    fn schema_is_rank_major_with_past_prefix() {
        let cfg = LagConfig::new(["score", "handler"])
            .with_lookback(2)
            .validate()
            .unwrap();
        let schema = build_lag_schema(&cfg);
        let names: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();

        assert_eq!(
            names,
            vec!["past_score_1", "past_handler_1", "past_score_2", "past_handler_2"]
        );
        assert_eq!(schema.columns[3].key(), LagKey::new("handler", 2));
    }

    #[test]
    fn fingerprint_tracks_rules() {
        let copy = LagConfig::new(["handler"]).validate().unwrap();
        let flag = LagConfig::new(["handler"])
            .with_rule("handler", TransformRule::EqualityFlag)
            .validate()
            .unwrap();

        assert_ne!(
            build_lag_schema(&copy).fingerprint,
            build_lag_schema(&flag).fingerprint
        );
        assert_eq!(
            build_lag_schema(&copy).fingerprint,
            build_lag_schema(&copy).fingerprint
        );
    }

    #[test]
    fn max_events_caps_targets_not_history() {
        let events: Vec<Event> = (1..=4).map(|day| event("A", day, Some("X"))).collect();
        let cfg = LagConfig {
            max_events: Some(10),
            ..LagConfig::new(["handler"])
        }
        .validate()
        .unwrap();
        assert_eq!(limit_targets(&events, &cfg).len(), 4);

        let cfg = LagConfig {
            max_events: Some(2),
            ..LagConfig::new(["handler"])
        }
        .validate()
        .unwrap();
        assert_eq!(limit_targets(&events, &cfg).len(), 2);
    }
}
