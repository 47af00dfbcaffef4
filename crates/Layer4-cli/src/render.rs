//! Plain-text rendering of reports

use std::fmt::Write;
use tandem_hub::{ObjectiveReport, ObjectiveStatus};
use tandem_task::{Task, TaskStatus};

pub fn submitted(report: &ObjectiveReport) -> String {
    let mut out = format!(
        "Objective {} submitted ({} sub-tasks, strategy {})\n",
        report.objective.id,
        report.subtasks.len(),
        report.objective.strategy
    );
    for (i, sub) in report.subtasks.iter().enumerate() {
        let _ = writeln!(
            out,
            "  {:>2}. {} [{}]",
            i + 1,
            sub.subtask.spec.description,
            sub.subtask.spec.capabilities.join(", ")
        );
    }
    out.trim_end().to_string()
}

pub fn objective(report: &ObjectiveReport) -> String {
    let objective = &report.objective;
    let mut out = String::new();
    let _ = writeln!(out, "Objective  {}", objective.id);
    let _ = writeln!(out, "Title      {}", objective.title);
    let _ = writeln!(out, "Status     {}", objective.status);
    let _ = writeln!(out, "Strategy   {}", objective.strategy);
    let _ = writeln!(out, "Updated    {}", objective.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(error) = &objective.last_error {
        let _ = writeln!(out, "Error      {}", error);
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{:<3} {:<10} {:<12} {:<14} {:<8} {}",
        "", "Task", "Status", "Spoke", "Retries", "Description"
    );
    let _ = writeln!(out, "{}", "-".repeat(72));
    for sub in &report.subtasks {
        let spoke = sub
            .subtask
            .spoke
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:<3} {:<10} {:<12} {:<14} {:<8} {}{}",
            sub.task_status.symbol(),
            sub.subtask.task_id.short(),
            sub.task_status.as_str(),
            truncate(&spoke, 14),
            sub.attempts,
            "  ".repeat(sub.subtask.depth as usize),
            sub.subtask.spec.description
        );
        for moved in &sub.subtask.redelegations {
            let _ = writeln!(out, "      redelegated {} -> {}", moved.from, moved.to);
        }
    }

    // Partial failure: one line per unsuccessful sub-task
    if objective.status != ObjectiveStatus::Done {
        let failures: Vec<_> = report
            .subtasks
            .iter()
            .filter(|s| s.task_status == TaskStatus::Failed)
            .collect();
        if !failures.is_empty() {
            let _ = writeln!(out);
            for sub in failures {
                let _ = writeln!(
                    out,
                    "FAILED {} after {} retries: {}",
                    sub.subtask.spec.description,
                    sub.attempts,
                    sub.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
    out.trim_end().to_string()
}

pub fn task_table(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "No tasks found.".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<10} {:<10} {:<9} {:<14} {}",
        "ID", "Status", "Priority", "Agent", "Description"
    );
    let _ = writeln!(out, "{}", "-".repeat(72));
    for task in tasks {
        let agent = task
            .assigned_agent
            .as_ref()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:<10} {:<10} {:<9} {:<14} {}",
            task.id.short(),
            task.status.as_str(),
            task.priority.as_str(),
            truncate(&agent, 14),
            truncate(&task.description, 40)
        );
        if task.status == TaskStatus::Failed {
            let _ = writeln!(
                out,
                "           last error ({} retries): {}",
                task.retry_count,
                task.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    out.trim_end().to_string()
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
