use std::path::{Path, PathBuf};

use entity_lag::{
    augment_against_history, augment_events, augment_partitioned, init_logging, load_run_config,
    log_app_start, log_mode_selected, logging_config_from_env, read_event_table,
    write_augmented_table, RunConfig,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum RunMode {
    Single,
    ReferenceHistory(PathBuf),
    Partitioned(usize),
}

fn parse_partitions(raw: Option<&str>) -> Result<Option<usize>, String> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.trim().parse::<usize>() {
        Ok(0) => Err("ENTITY_LAG_PARTITIONS must be a positive integer, got 0".to_string()),
        Ok(partitions) => Ok(Some(partitions)),
        Err(err) => Err(format!(
            "ENTITY_LAG_PARTITIONS must be a positive integer: {err}"
        )),
    }
}

fn select_mode(history: Option<PathBuf>, partitions: Option<usize>) -> Result<RunMode, String> {
    match (history, partitions) {
        (Some(_), Some(_)) => Err(
            "ENTITY_LAG_HISTORY and ENTITY_LAG_PARTITIONS cannot be combined".to_string(),
        ),
        (Some(path), None) => Ok(RunMode::ReferenceHistory(path)),
        (None, Some(partitions)) => Ok(RunMode::Partitioned(partitions)),
        (None, None) => Ok(RunMode::Single),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg);

    let input_path = std::env::var("ENTITY_LAG_INPUT")
        .map(PathBuf::from)
        .map_err(|_| "ENTITY_LAG_INPUT must point at an event CSV")?;
    let output_path = std::env::var("ENTITY_LAG_OUTPUT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("augmented.csv"));
    let history_path = std::env::var("ENTITY_LAG_HISTORY").ok().map(PathBuf::from);
    let partitions = parse_partitions(std::env::var("ENTITY_LAG_PARTITIONS").ok().as_deref())?;
    let mode = select_mode(history_path, partitions)?;

    let run_cfg = match std::env::var("ENTITY_LAG_CONFIG") {
        Ok(path) => load_run_config(Path::new(&path))?,
        Err(_) => RunConfig::default(),
    };

    let targets = read_event_table(&input_path, &run_cfg.layout)?;
    let attribute_columns = targets.attribute_columns.clone();
    let lag_cfg = run_cfg.lag.clone().or_source_columns(&attribute_columns);

    let run = match mode {
        RunMode::ReferenceHistory(history_path) => {
            log_mode_selected("reference_history", Some(history_path.as_path()), None);
            let history = read_event_table(&history_path, &run_cfg.layout)?;
            augment_against_history(targets.events, history.events, &lag_cfg)?
        }
        RunMode::Partitioned(partitions) => {
            log_mode_selected("partitioned", None, Some(partitions));
            augment_partitioned(targets.events, &lag_cfg, partitions)?
        }
        RunMode::Single => {
            log_mode_selected("single", None, None);
            augment_events(targets.events, &lag_cfg)?
        }
    };

    write_augmented_table(
        &output_path,
        &run_cfg.layout,
        &attribute_columns,
        &run.schema,
        &run.augmented,
    )?;

    println!(
        "Augmented {} of {} events ({} rejected, {} entities, {} lag columns) -> {}",
        run.report.output_events,
        run.report.input_events,
        run.report.rejected_events,
        run.report.entity_count,
        run.schema.columns.len(),
        output_path.display()
    );
    if let Some(first_error) = &run.report.first_error {
        println!("First rejection: {first_error}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_must_be_positive() {
        assert_eq!(parse_partitions(None), Ok(None));
        assert_eq!(parse_partitions(Some(" 4 ")), Ok(Some(4)));
        assert!(parse_partitions(Some("0")).is_err());
        assert!(parse_partitions(Some("-2")).is_err());
        assert!(parse_partitions(Some("many")).is_err());
    }

    #[test]
    fn history_and_partitions_are_exclusive() {
        let history = Some(PathBuf::from("history.csv"));

        assert!(select_mode(history.clone(), Some(2)).is_err());
        assert_eq!(
            select_mode(history, None),
            Ok(RunMode::ReferenceHistory(PathBuf::from("history.csv")))
        );
        assert_eq!(select_mode(None, Some(2)), Ok(RunMode::Partitioned(2)));
        assert_eq!(select_mode(None, None), Ok(RunMode::Single));
    }
}
