//! Bulk submission from CSV files.
//!
//! `fleetup upgrade fleet.csv` and friends: one job per row, with the same
//! client-side checks as `job submit`. Rows that cannot be queued (no
//! upgrade path, device already owned by a job, unknown serial) are
//! reported and skipped; the command succeeds as long as the file itself
//! was usable.

use std::path::Path;

use anyhow::{Context as _, Result, bail};

use fleetup_core::inventory::Inventory;
use fleetup_core::job::JobType;
use fleetup_core::upgrade_paths::UpgradePathTable;

use crate::Context;
use crate::commands::submit_job;

/// Which bulk flavor was invoked.
#[derive(Debug, Clone, Copy)]
pub enum BulkKind {
    /// Full upgrade, one serial per row.
    Upgrade,
    /// Full upgrade, one HA pair per row.
    UpgradeHaPairs,
    /// Download only, one serial per row.
    Download,
    /// Download only, one HA pair per row.
    DownloadHaPairs,
}

impl BulkKind {
    fn job_type(self) -> JobType {
        match self {
            Self::Upgrade => JobType::Standalone,
            Self::UpgradeHaPairs => JobType::HaPair,
            Self::Download => JobType::DownloadOnly,
            Self::DownloadHaPairs => JobType::DownloadOnlyHa,
        }
    }

    fn is_pairs(self) -> bool {
        matches!(self, Self::UpgradeHaPairs | Self::DownloadHaPairs)
    }
}

/// Entry point.
pub fn run(ctx: &Context, csv_path: &Path, kind: BulkKind, dry_run: bool) -> Result<()> {
    let rows = if kind.is_pairs() {
        read_pair_rows(csv_path)?
    } else {
        read_serial_rows(csv_path)?
    };
    if rows.is_empty() {
        bail!("{} contains no usable rows", csv_path.display());
    }

    let inventory =
        Inventory::load(&ctx.workdir.inventory_file()).context("could not load inventory")?;
    let table = UpgradePathTable::load(&ctx.workdir.upgrade_paths_file())
        .context("could not load upgrade paths")?;

    let mut queued = 0usize;
    let mut skipped: Vec<String> = Vec::new();

    for devices in rows {
        let label = devices.join("/");

        // Every member must resolve, and the lead device must have a path;
        // the daemon re-checks all of this, but a bulk run wants the skip
        // reasons up front.
        let mut row_error = None;
        for serial in &devices {
            match inventory.require(serial) {
                Ok(device) => {
                    if table.plan(&device.current_version).is_none() {
                        row_error = Some(format!(
                            "no upgrade path for {} (version {})",
                            serial, device.current_version
                        ));
                        break;
                    }
                }
                Err(err) => {
                    row_error = Some(err.to_string());
                    break;
                }
            }
        }
        if let Some(reason) = row_error {
            skipped.push(format!("{label}: {reason}"));
            continue;
        }

        let pair_name = if devices.len() == 2 { label.clone() } else { String::new() };
        match submit_job(ctx, kind.job_type(), devices, pair_name, dry_run) {
            Ok(job) => {
                println!("  queued {label} as {}", job.job_id);
                queued += 1;
            }
            Err(err) => skipped.push(format!("{label}: {err}")),
        }
    }

    println!("\nSummary: {queued} queued, {} skipped", skipped.len());
    for line in &skipped {
        println!("  skipped {line}");
    }
    if queued > 0 {
        println!("\nMonitor with: fleetup daemon status");
    }
    Ok(())
}

/// Reads rows from a CSV with a `serial` column.
fn read_serial_rows(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("could not open {}", path.display()))?;
    let serial_idx = column_index(&mut reader, "serial")?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("unreadable CSV row")?;
        if let Some(serial) = record.get(serial_idx).map(str::trim).filter(|s| !s.is_empty()) {
            rows.push(vec![serial.to_string()]);
        }
    }
    Ok(rows)
}

/// Reads rows from a CSV with `serial_a` and `serial_b` columns.
fn read_pair_rows(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("could not open {}", path.display()))?;
    let a_idx = column_index(&mut reader, "serial_a")?;
    let b_idx = column_index(&mut reader, "serial_b")?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("unreadable CSV row")?;
        let a = record.get(a_idx).map(str::trim).unwrap_or_default();
        let b = record.get(b_idx).map(str::trim).unwrap_or_default();
        if !a.is_empty() && !b.is_empty() {
            rows.push(vec![a.to_string(), b.to_string()]);
        }
    }
    Ok(rows)
}

fn column_index(reader: &mut csv::Reader<std::fs::File>, name: &str) -> Result<usize> {
    reader
        .headers()
        .context("could not read CSV header")?
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(name))
        .with_context(|| format!("CSV is missing a `{name}` column"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_rows_read_the_serial_column_wherever_it_is() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.csv");
        std::fs::write(
            &path,
            "hostname,serial,notes\nfw-01,001234567890,edge\nfw-02,001234567891,\n,,\n",
        )
        .unwrap();

        let rows = read_serial_rows(&path).unwrap();
        assert_eq!(
            rows,
            vec![vec!["001234567890".to_string()], vec!["001234567891".to_string()]]
        );
    }

    #[test]
    fn missing_serial_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "hostname,notes\nfw-01,x\n").unwrap();

        let err = read_serial_rows(&path).unwrap_err();
        assert!(err.to_string().contains("serial"));
    }

    #[test]
    fn pair_rows_need_both_members() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairs.csv");
        std::fs::write(
            &path,
            "pair,serial_a,serial_b\nedge,AAA,BBB\nincomplete,CCC,\n",
        )
        .unwrap();

        let rows = read_pair_rows(&path).unwrap();
        assert_eq!(rows, vec![vec!["AAA".to_string(), "BBB".to_string()]]);
    }
}
