//! `fetchmux checkpoints`: inspect the persisted tracker state.

use std::fmt::Write as _;

use anyhow::Context;

use fetchmux_tracker::{ObjectTracker, StateMap};

use crate::cli::CheckpointsOpts;

pub async fn cmd_checkpoints(opts: &CheckpointsOpts) -> anyhow::Result<()> {
    let tracker = ObjectTracker::open(&opts.state)
        .await
        .with_context(|| format!("failed to load {}", opts.state.display()))?;
    let snapshot = tracker.snapshot().await;
    if opts.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", render_table(&snapshot));
    }
    Ok(())
}

/// One row per `(group, object)`, sorted.
pub fn render_table(states: &StateMap) -> String {
    let rows: Vec<[String; 5]> = states
        .iter()
        .flat_map(|(group, objects)| {
            objects.iter().map(move |(object, state)| {
                [
                    group.clone(),
                    object.clone(),
                    state.latest_time.to_rfc3339(),
                    state.updated.to_rfc3339(),
                    if state.key.is_empty() {
                        "-".to_string()
                    } else {
                        state.key.clone()
                    },
                ]
            })
        })
        .collect();

    let header = ["GROUP", "OBJECT", "WATERMARK", "UPDATED", "CURSOR"];
    let mut widths = header.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = String::new();
    let mut line = |cells: &[&str]| {
        let mut text = String::new();
        for (i, cell) in cells.iter().enumerate() {
            if i + 1 == cells.len() {
                text.push_str(cell);
            } else {
                let _ = write!(text, "{cell:<width$}  ", width = widths[i]);
            }
        }
        out.push_str(text.trim_end());
        out.push('\n');
    };
    line(&header);
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        line(&cells);
    }
    if rows.is_empty() {
        out.push_str("(no checkpoints)\n");
    }
    out
}
