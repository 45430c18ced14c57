//! Admin command surface.
//!
//! Commands arrive as private-chat text beginning with `/`. Parsing is
//! pure ([`CommandParser::parse`]); [`CommandHandler::execute`] runs the
//! command against the store and returns the reply text.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{info, warn};

use crate::pipeline::TaskMatcher;
use crate::pipeline::batch::{BatchCopier, BatchPacing, BatchRequest, run_batch};
use crate::store::TaskStore;

const USAGE: &str = "Commands:\n\
/tasks - list your tasks\n\
/toggle <label> - start or stop a task\n\
/delete <label> - delete a task\n\
/stats <label> - delivery counts\n\
/batch <start_link> <end_link> <dest_id> - copy a message range";

/// A parsed admin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListTasks,
    Toggle { label: String },
    Delete { label: String },
    Stats { label: String },
    Batch {
        start: String,
        end: String,
        destination: i64,
    },
    Help,
    /// Known command with bad arguments, or an unknown command.
    Invalid { reason: String },
}

pub struct CommandParser;

impl CommandParser {
    /// Parse message text into a command; `None` when it is not a command.
    pub fn parse(text: &str) -> Option<Command> {
        let trimmed = text.trim();
        if !trimmed.starts_with('/') {
            return None;
        }

        let mut words = trimmed.split_whitespace();
        let head = words.next()?;
        // `/tasks@SomeBot` addresses a specific bot in group chats.
        let name = head.split('@').next().unwrap_or(head).to_lowercase();
        let args: Vec<&str> = words.collect();

        let command = match name.as_str() {
            "/tasks" | "/list" => Command::ListTasks,
            "/help" | "/start" => Command::Help,
            "/toggle" => label_arg(&args, |label| Command::Toggle { label }),
            "/delete" => label_arg(&args, |label| Command::Delete { label }),
            "/stats" => label_arg(&args, |label| Command::Stats { label }),
            "/batch" => parse_batch(&args),
            other => Command::Invalid {
                reason: format!("Unknown command {other}"),
            },
        };
        Some(command)
    }
}

/// Labels may contain spaces; everything after the command is the label.
fn label_arg(args: &[&str], build: impl FnOnce(String) -> Command) -> Command {
    let label = args.join(" ");
    if label.is_empty() {
        Command::Invalid {
            reason: "A task label is required".into(),
        }
    } else {
        build(label)
    }
}

fn parse_batch(args: &[&str]) -> Command {
    let [start, end, dest] = args else {
        return Command::Invalid {
            reason: "Usage: /batch <start_link> <end_link> <dest_id>".into(),
        };
    };
    match dest.parse::<i64>() {
        Ok(destination) => Command::Batch {
            start: (*start).to_string(),
            end: (*end).to_string(),
            destination,
        },
        Err(_) => Command::Invalid {
            reason: format!("Destination '{dest}' is not a chat id"),
        },
    }
}

// ── Execution ───────────────────────────────────────────────────────

pub struct CommandHandler {
    store: Arc<dyn TaskStore>,
    matcher: Arc<TaskMatcher>,
    copier: Arc<dyn BatchCopier>,
    pacing: BatchPacing,
}

impl CommandHandler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        matcher: Arc<TaskMatcher>,
        copier: Arc<dyn BatchCopier>,
        pacing: BatchPacing,
    ) -> Self {
        Self {
            store,
            matcher,
            copier,
            pacing,
        }
    }

    /// Run `command` on behalf of `owner_id` and produce the reply.
    ///
    /// Store failures become a reply, never an error: the admin sees what
    /// went wrong and the engine keeps running.
    pub async fn execute(&self, owner_id: i64, command: Command) -> String {
        match command {
            Command::ListTasks => self.list_tasks(owner_id).await,
            Command::Toggle { label } => self.toggle(owner_id, &label).await,
            Command::Delete { label } => self.delete(owner_id, &label).await,
            Command::Stats { label } => self.stats(owner_id, &label).await,
            Command::Batch {
                start,
                end,
                destination,
            } => self.batch(&start, &end, destination).await,
            Command::Help => USAGE.to_string(),
            Command::Invalid { reason } => format!("{reason}\n\n{USAGE}"),
        }
    }

    async fn list_tasks(&self, owner_id: i64) -> String {
        let tasks = match self.store.list_tasks_for_owner(owner_id).await {
            Ok(tasks) => tasks,
            Err(e) => return store_failure("list tasks", &e),
        };
        if tasks.is_empty() {
            return "You have no tasks.".into();
        }

        let mut out = String::from("Your tasks:");
        for task in &tasks {
            let _ = write!(
                out,
                "\n• {} [{}] {} source(s) → {} destination(s)",
                task.label,
                task.status,
                task.sources.len(),
                task.destinations.len()
            );
        }
        out
    }

    async fn toggle(&self, owner_id: i64, label: &str) -> String {
        let task = match self.store.get_task(owner_id, label).await {
            Ok(Some(task)) => task,
            Ok(None) => return not_found(label),
            Err(e) => return store_failure("load task", &e),
        };

        let next = task.status.toggled();
        match self.store.set_status(owner_id, label, next).await {
            Ok(true) => {
                self.matcher.invalidate();
                info!(owner = owner_id, task = %label, status = %next, "Task toggled");
                format!("Task '{label}' is now {next}.")
            }
            Ok(false) => not_found(label),
            Err(e) => store_failure("update task", &e),
        }
    }

    async fn delete(&self, owner_id: i64, label: &str) -> String {
        match self.store.delete_task(owner_id, label).await {
            Ok(true) => {
                self.matcher.invalidate();
                info!(owner = owner_id, task = %label, "Task deleted");
                format!("Task '{label}' deleted.")
            }
            Ok(false) => not_found(label),
            Err(e) => store_failure("delete task", &e),
        }
    }

    async fn stats(&self, owner_id: i64, label: &str) -> String {
        match self.store.get_task(owner_id, label).await {
            Ok(Some(_)) => {}
            Ok(None) => return not_found(label),
            Err(e) => return store_failure("load task", &e),
        }

        match self.store.get_stats(owner_id, label).await {
            Ok(Some(stats)) => format!(
                "Task '{label}': {} delivered, {} failed (updated {}).",
                stats.delivered,
                stats.failed,
                stats.updated_at.format("%Y-%m-%d %H:%M UTC")
            ),
            Ok(None) => format!("Task '{label}' has no deliveries yet."),
            Err(e) => store_failure("load stats", &e),
        }
    }

    async fn batch(&self, start: &str, end: &str, destination: i64) -> String {
        let request = match BatchRequest::from_links(start, end, destination) {
            Ok(request) => request,
            Err(e) => return e.to_string(),
        };

        let report = run_batch(self.copier.as_ref(), request, self.pacing).await;
        if report.failed_ids.is_empty() {
            format!("Batch complete: {} message(s) copied.", report.copied)
        } else {
            format!(
                "Batch complete: {} copied, {} failed (ids: {}).",
                report.copied,
                report.failed(),
                report
                    .failed_ids
                    .iter()
                    .map(i64::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        }
    }
}

fn not_found(label: &str) -> String {
    format!("No task named '{label}'.")
}

fn store_failure(op: &str, error: &crate::error::DatabaseError) -> String {
    warn!(op, error = %error, "Command failed on store");
    format!("Could not {op}, try again later.")
}
