//! SQLite run history
//!
//! Append-only: a run is written once, inside one transaction, together with
//! one row per combination. Re-appending the same run id fails. The full
//! artifact is kept as JSON next to the queryable columns so any stored run
//! can be reloaded exactly as it was reported.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::OptimizerResult;
use crate::report::RunReport;

/// One row of `optimization_runs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub strategy: String,
    pub status: String,
    pub target: String,
    pub total_combinations: i64,
    pub train_succeeded: i64,
    pub train_failed: i64,
    pub best_score: Option<f64>,
    pub best_params: Option<String>,
    pub low_confidence: bool,
    pub started_at: String,
    pub duration_secs: Option<f64>,
}

/// One row of `optimization_results`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub combination_index: i64,
    pub params: String,
    pub train_status: Option<String>,
    pub test_status: Option<String>,
    pub overfitting_ratio: Option<f64>,
    pub overfitting_class: Option<String>,
    pub leaderboard_rank: Option<i64>,
    pub composite_score: Option<f64>,
}

pub struct RunStore {
    conn: Mutex<Connection>,
    json_backup_path: Option<PathBuf>,
}

impl RunStore {
    /// Open (or create) the database. With a backup path every append also
    /// refreshes a JSON dump of the run list.
    pub fn new<P: AsRef<Path>>(db_path: P, json_backup_path: Option<PathBuf>) -> OptimizerResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Mutex::new(conn),
            json_backup_path,
        };
        store.create_tables()?;
        info!("Run store opened at {}", db_path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> OptimizerResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
            json_backup_path: None,
        };
        store.create_tables()?;
        Ok(store)
    }

    fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn create_tables(&self) -> OptimizerResult<()> {
        let conn = self.connection();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS optimization_runs (
                run_id TEXT PRIMARY KEY,
                strategy TEXT NOT NULL,
                status TEXT NOT NULL,
                target TEXT NOT NULL,
                direction TEXT NOT NULL,
                parameter_space TEXT NOT NULL,
                total_combinations INTEGER NOT NULL,
                train_start TEXT NOT NULL,
                train_end TEXT NOT NULL,
                test_start TEXT,
                test_end TEXT,
                workers INTEGER NOT NULL,
                train_succeeded INTEGER NOT NULL,
                train_failed INTEGER NOT NULL,
                best_score REAL,
                best_params TEXT,
                low_confidence INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                duration_secs REAL,
                report TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS optimization_results (
                run_id TEXT NOT NULL REFERENCES optimization_runs(run_id),
                combination_index INTEGER NOT NULL,
                params TEXT NOT NULL,
                train_status TEXT,
                train_metrics TEXT,
                test_status TEXT,
                test_metrics TEXT,
                overfitting_ratio REAL,
                overfitting_class TEXT,
                leaderboard_rank INTEGER,
                composite_score REAL,
                PRIMARY KEY (run_id, combination_index)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_strategy ON optimization_runs(strategy, started_at)",
            [],
        )?;

        debug!("Run store tables ready");
        Ok(())
    }

    /// Persist a report. Fails without writing anything if the run id exists.
    pub fn append_report(&self, report: &RunReport) -> OptimizerResult<()> {
        let mut conn = self.connection();
        let tx = conn.transaction()?;

        let best = report.leaderboard.first();
        let report_json = serde_json::to_string(report)?;
        let m = &report.metadata;

        tx.execute(
            "INSERT INTO optimization_runs
             (run_id, strategy, status, target, direction, parameter_space,
              total_combinations, train_start, train_end, test_start, test_end,
              workers, train_succeeded, train_failed, best_score, best_params,
              low_confidence, started_at, finished_at, duration_secs, report)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21)",
            params![
                report.run_id,
                report.strategy,
                report.status.as_str(),
                report.target.as_str(),
                report.direction.to_string(),
                report.parameter_space.to_string(),
                report.total_combinations as i64,
                report.train_period.start.to_string(),
                report.train_period.end.to_string(),
                report.test_period.map(|t| t.start.to_string()),
                report.test_period.map(|t| t.end.to_string()),
                m.workers as i64,
                m.train_succeeded as i64,
                m.train_failed as i64,
                best.map(|b| b.composite_score),
                best.map(|b| b.combination.to_string()),
                report.low_confidence,
                m.started_at.to_rfc3339(),
                m.finished_at.map(|t| t.to_rfc3339()),
                m.duration_secs,
                report_json,
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO optimization_results
                 (run_id, combination_index, params, train_status, train_metrics,
                  test_status, test_metrics, overfitting_ratio, overfitting_class,
                  leaderboard_rank, composite_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;

            for result in &report.results {
                let index = result.combination.index;
                let ranked = report
                    .leaderboard
                    .iter()
                    .find(|r| r.combination.index == index);
                let status = |o: &crate::types::EvaluationOutcome| {
                    if o.is_success() { "success" } else { "failure" }
                };
                let train_metrics = match &result.train {
                    Some(o) => Some(serde_json::to_string(o)?),
                    None => None,
                };
                let test_metrics = match &result.test {
                    Some(o) => Some(serde_json::to_string(o)?),
                    None => None,
                };

                stmt.execute(params![
                    report.run_id,
                    index as i64,
                    result.combination.to_json().to_string(),
                    result.train.as_ref().map(status),
                    train_metrics,
                    result.test.as_ref().map(status),
                    test_metrics,
                    result.overfitting.and_then(|o| o.ratio),
                    result.overfitting.map(|o| o.classification.as_str()),
                    ranked.map(|r| r.rank as i64),
                    ranked.map(|r| r.composite_score),
                ])?;
            }
        }

        tx.commit()?;
        info!(
            "Stored run {} ({} combinations)",
            report.run_id,
            report.results.len()
        );

        if self.json_backup_path.is_some() {
            drop(conn);
            self.export_json()?;
        }
        Ok(())
    }

    /// The stored artifact, exactly as appended
    pub fn load_report(&self, run_id: &str) -> OptimizerResult<Option<RunReport>> {
        let conn = self.connection();
        let json: Option<String> = conn
            .query_row(
                "SELECT report FROM optimization_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => {
                debug!("No stored run {}", run_id);
                Ok(None)
            }
        }
    }

    /// Most recent runs first
    pub fn list_runs(&self, limit: usize) -> OptimizerResult<Vec<RunSummary>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT run_id, strategy, status, target, total_combinations, train_succeeded,
                    train_failed, best_score, best_params, low_confidence, started_at,
                    duration_secs
             FROM optimization_runs
             ORDER BY started_at DESC, run_id
             LIMIT ?1",
        )?;

        let runs = stmt
            .query_map(params![limit as i64], |row| {
                Ok(RunSummary {
                    run_id: row.get(0)?,
                    strategy: row.get(1)?,
                    status: row.get(2)?,
                    target: row.get(3)?,
                    total_combinations: row.get(4)?,
                    train_succeeded: row.get(5)?,
                    train_failed: row.get(6)?,
                    best_score: row.get(7)?,
                    best_params: row.get(8)?,
                    low_confidence: row.get(9)?,
                    started_at: row.get(10)?,
                    duration_secs: row.get(11)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Loaded {} run summaries", runs.len());
        Ok(runs)
    }

    pub fn results_for_run(&self, run_id: &str) -> OptimizerResult<Vec<StoredResult>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT combination_index, params, train_status, test_status, overfitting_ratio,
                    overfitting_class, leaderboard_rank, composite_score
             FROM optimization_results
             WHERE run_id = ?1
             ORDER BY combination_index",
        )?;

        let results = stmt
            .query_map(params![run_id], |row| {
                Ok(StoredResult {
                    combination_index: row.get(0)?,
                    params: row.get(1)?,
                    train_status: row.get(2)?,
                    test_status: row.get(3)?,
                    overfitting_ratio: row.get(4)?,
                    overfitting_class: row.get(5)?,
                    leaderboard_rank: row.get(6)?,
                    composite_score: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(results)
    }

    /// Dump the run list to the backup path, if one is configured
    pub fn export_json(&self) -> OptimizerResult<()> {
        let Some(path) = &self.json_backup_path else {
            return Ok(());
        };
        let runs = self.list_runs(usize::MAX >> 1)?;

        let state = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "runs": runs,
        });

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&state)?)?;
        debug!("Run history exported to: {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OptimizerError;
    use crate::expander::ParameterSpace;
    use crate::ranking::RankingEngine;
    use crate::run::{OptimizationRun, RunSetup};
    use crate::types::{DateRange, Direction, EvaluationOutcome, Metric, MetricBundle, Phase};
    use chrono::NaiveDate;

    fn report() -> RunReport {
        let space = ParameterSpace::parse("period:10,20").unwrap();
        let combinations = space.expand(10).unwrap();
        let window = DateRange::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        )
        .unwrap();
        let mut run = OptimizationRun::new(RunSetup {
            strategy: "ema_cross".to_string(),
            space,
            combinations,
            target: Metric::SharpeRatio,
            direction: Direction::Maximize,
            symbols: vec![],
            window,
            train_period: window,
            test_period: None,
            workers: 1,
        });
        run.start().unwrap();
        run.record_outcomes(
            Phase::Train,
            &[0, 1],
            vec![
                Some(EvaluationOutcome::Success(MetricBundle::from_iter([(Metric::SharpeRatio, 0.5)]))),
                Some(EvaluationOutcome::Success(MetricBundle::from_iter([(Metric::SharpeRatio, 1.0)]))),
            ],
        )
        .unwrap();
        run.complete().unwrap();
        RunReport::assemble(&run, &RankingEngine::default(), 10).unwrap()
    }

    #[test]
    fn test_append_and_read_back() {
        let store = RunStore::open_in_memory().unwrap();
        let report = report();
        store.append_report(&report).unwrap();

        let loaded = store.load_report(&report.run_id).unwrap().unwrap();
        assert_eq!(loaded.run_id, report.run_id);
        assert_eq!(loaded.results, report.results);

        let runs = store.list_runs(10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "completed");
        assert_eq!(runs[0].best_params.as_deref(), Some("period=20"));

        let results = store.results_for_run(&report.run_id).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].leaderboard_rank, Some(1));
        assert_eq!(results[0].train_status.as_deref(), Some("success"));
    }

    #[test]
    fn test_duplicate_append_is_refused() {
        let store = RunStore::open_in_memory().unwrap();
        let report = report();
        store.append_report(&report).unwrap();
        assert!(matches!(
            store.append_report(&report),
            Err(OptimizerError::Persistence(_))
        ));
        // The failed append left nothing behind
        assert_eq!(store.results_for_run(&report.run_id).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_run() {
        let store = RunStore::open_in_memory().unwrap();
        assert!(store.load_report("0000000000000000").unwrap().is_none());
        assert!(store.list_runs(5).unwrap().is_empty());
    }

    #[test]
    fn test_file_store_with_backup() {
        let dir = std::env::temp_dir().join(format!("optimizer_store_{}", std::process::id()));
        let backup = dir.join("runs.json");
        let store = RunStore::new(dir.join("runs.db"), Some(backup.clone())).unwrap();
        store.append_report(&report()).unwrap();

        let dump: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&backup).unwrap()).unwrap();
        assert_eq!(dump["runs"].as_array().unwrap().len(), 1);

        drop(store);
        std::fs::remove_dir_all(&dir).ok();
    }
}
