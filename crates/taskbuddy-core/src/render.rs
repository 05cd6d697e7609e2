use std::io::{self, IsTerminal, Write};

use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::accessor::BatchReport;
use crate::config::Config;
use crate::datetime::{format_activity_time, format_due_display};
use crate::reorder::DragHandle;
use crate::session::UserIdentity;
use crate::task::{Attachment, Status, Task, TaskId};
use crate::view::{Partitions, highlight};

const BOARD_COLUMN_WIDTH: usize = 32;

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color = cfg.get_bool("color").unwrap_or(true) && io::stdout().is_terminal();
        Ok(Self { color })
    }

    pub fn plain() -> Self {
        Self { color: false }
    }

    #[tracing::instrument(skip_all)]
    pub fn print_list(
        &self,
        parts: &Partitions<'_>,
        search: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.write_list(&mut io::stdout().lock(), parts, search, now)
    }

    /// One section per status with a header and count, then a table of rows.
    pub fn write_list<W: Write>(
        &self,
        out: &mut W,
        parts: &Partitions<'_>,
        search: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if parts.total() == 0 {
            writeln!(out, "No tasks found.")?;
            return Ok(());
        }

        let headers = vec![
            "ID".to_string(),
            "Task Name".to_string(),
            "Due on".to_string(),
            "Task Status".to_string(),
            "Task Category".to_string(),
        ];

        for (status, tasks) in parts.iter() {
            let heading = format!("{} ({})", status.label(), tasks.len());
            writeln!(out, "{}", self.paint(&heading, status_color(status)))?;

            if tasks.is_empty() {
                writeln!(out, "  No tasks in {}", status.label())?;
                writeln!(out)?;
                continue;
            }

            let rows = tasks
                .iter()
                .map(|task| {
                    let mut title = self.highlighted(&task.title, search);
                    if task.status == Status::Completed {
                        title = self.paint(&title, "9");
                    }
                    vec![
                        self.paint(task.id.short(), "33"),
                        title,
                        format_due_display(&task.due_date, now),
                        task.status.to_string(),
                        self.highlighted(task.category.as_str(), search),
                    ]
                })
                .collect();

            write_table(&mut *out, &headers, rows)?;
            writeln!(out)?;
        }

        Ok(())
    }

    #[tracing::instrument(skip_all)]
    pub fn print_board(
        &self,
        parts: &Partitions<'_>,
        search: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.write_board(&mut io::stdout().lock(), parts, search, now)
    }

    /// Three columns side by side. Each card leads with its drag handle.
    pub fn write_board<W: Write>(
        &self,
        out: &mut W,
        parts: &Partitions<'_>,
        search: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let columns: Vec<Vec<String>> = parts
            .iter()
            .map(|(status, tasks)| {
                let mut lines = vec![
                    self.paint(
                        &format!("{} ({})", status.label(), tasks.len()),
                        status_color(status),
                    ),
                    String::new(),
                ];
                if tasks.is_empty() {
                    lines.push(format!("No tasks in {}", status.label()));
                }
                for task in tasks {
                    let handle = DragHandle {
                        status: Some(task.status),
                        id: TaskId::new(task.id.short()),
                    };
                    lines.push(self.paint(&format!("[{handle}]"), "33"));
                    lines.push(self.highlighted(&clip(&task.title, BOARD_COLUMN_WIDTH), search));
                    lines.push(format!(
                        "{} | {}",
                        self.highlighted(task.category.as_str(), search),
                        format_due_display(&task.due_date, now)
                    ));
                    lines.push(String::new());
                }
                lines
            })
            .collect();

        let height = columns.iter().map(Vec::len).max().unwrap_or(0);
        for row in 0..height {
            let mut line = String::new();
            for column in &columns {
                let cell = column.get(row).map(String::as_str).unwrap_or("");
                let visible = UnicodeWidthStr::width(strip_ansi(cell).as_str());
                line.push_str(cell);
                line.push_str(&" ".repeat(BOARD_COLUMN_WIDTH.saturating_sub(visible) + 2));
            }
            writeln!(out, "{}", line.trim_end())?;
        }

        Ok(())
    }

    #[tracing::instrument(skip(self, task, now), fields(id = %task.id))]
    pub fn print_task_info(&self, task: &Task, now: DateTime<Utc>) -> anyhow::Result<()> {
        self.write_task_info(&mut io::stdout().lock(), task, now)
    }

    pub fn write_task_info<W: Write>(
        &self,
        out: &mut W,
        task: &Task,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        writeln!(out, "id        {}", task.id)?;
        writeln!(out, "title     {}", task.title)?;
        writeln!(
            out,
            "due       {} ({})",
            format_due_display(&task.due_date, now),
            task.due_date
        )?;
        writeln!(
            out,
            "status    {}",
            self.paint(task.status.as_str(), status_color(task.status))
        )?;
        writeln!(out, "category  {}", task.category)?;
        writeln!(out, "order     {}", task.order)?;
        if let Some(description) = &task.description {
            writeln!(out, "desc      {description}")?;
        }
        match &task.image {
            Some(Attachment::Remote(reference)) => writeln!(out, "image     {reference}")?,
            Some(Attachment::Local(path)) => {
                writeln!(out, "image     {} (not uploaded)", path.display())?
            }
            None => {}
        }

        writeln!(out)?;
        writeln!(out, "Activity")?;
        if task.activity.is_empty() {
            writeln!(out, "  (none)")?;
        }
        for item in &task.activity {
            writeln!(
                out,
                "  {}  {}",
                self.paint(&format_activity_time(&item.timestamp), "2"),
                item.message
            )?;
        }

        Ok(())
    }

    pub fn print_user(&self, user: &UserIdentity) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{} ({})", user.label(), user.uid)?;
        if let Some(photo) = &user.photo_url {
            writeln!(out, "photo  {photo}")?;
        }
        Ok(())
    }

    /// Summary line plus one line per failed write.
    pub fn print_batch_report(&self, verb: &str, report: &BatchReport) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        let noun = if report.applied.len() == 1 { "task" } else { "tasks" };
        writeln!(out, "{verb} {} {noun}.", report.applied.len())?;
        for (id, err) in &report.failed {
            writeln!(out, "{}", self.paint(&format!("  {}: {err}", id.short()), "31"))?;
        }
        Ok(())
    }

    fn highlighted(&self, text: &str, query: &str) -> String {
        highlight(text, query)
            .into_iter()
            .map(|segment| {
                if segment.matched {
                    self.paint(&segment.text, "1;4")
                } else {
                    segment.text
                }
            })
            .collect()
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color || text.is_empty() {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

fn status_color(status: Status) -> &'static str {
    match status {
        Status::Todo => "35",
        Status::InProgress => "36",
        Status::Completed => "32",
    }
}

fn clip(text: &str, width: usize) -> String {
    if UnicodeWidthStr::width(text) <= width {
        return text.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let w = UnicodeWidthChar::width(ch).unwrap_or(0);
        if used + w + 1 > width {
            break;
        }
        used += w;
        out.push(ch);
    }
    out.push('…');
    out
}

fn write_table<W: Write>(
    mut writer: W,
    headers: &[String],
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths: Vec<usize> = headers
        .iter()
        .map(|header| UnicodeWidthStr::width(header.as_str()))
        .collect();

    for row in &rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    let mut header_line = String::new();
    let mut rule_line = String::new();
    for (header, width) in headers.iter().zip(&widths) {
        header_line.push_str(&format!("{header:width$} ", width = *width));
        rule_line.push_str(&format!("{:-<width$} ", "", width = *width));
    }
    writeln!(writer, "{}", header_line.trim_end())?;
    writeln!(writer, "{}", rule_line.trim_end())?;

    for row in rows {
        let mut line = String::new();
        for (cell, width) in row.iter().zip(&widths) {
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            line.push_str(cell);
            line.push_str(&" ".repeat(width.saturating_sub(visible_width) + 1));
        }
        writeln!(writer, "{}", line.trim_end())?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::task::{ActivityItem, Category, TaskDraft};
    use crate::view::ViewCriteria;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn tasks() -> Vec<Task> {
        vec![
            TaskDraft::new("Write report", "2024-06-01T00:00:00.000Z")
                .into_task(TaskId::new("aaaaaaaa1111"), 1),
            TaskDraft::new("Buy milk", "2024-06-09T00:00:00.000Z")
                .with_status(Status::Completed)
                .with_category(Category::Personal)
                .into_task(TaskId::new("bbbbbbbb2222"), 2),
        ]
    }

    fn render(f: impl FnOnce(&mut Vec<u8>) -> anyhow::Result<()>) -> String {
        let mut buf = Vec::new();
        f(&mut buf).expect("render");
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn color_follows_config_bool() {
        let mut cfg = Config::default();
        for off in ["off", "n", "no", "0", "false"] {
            cfg.set("color", off);
            assert!(!Renderer::new(&cfg).expect("renderer").color, "{off}");
        }
    }

    #[test]
    fn list_has_sections_with_counts() {
        let tasks = tasks();
        let parts = ViewCriteria::default().partition(&tasks);
        let text = render(|buf| Renderer::plain().write_list(buf, &parts, "", now()));

        assert!(text.contains("TO DO (1)"));
        assert!(text.contains("IN PROGRESS (0)"));
        assert!(text.contains("No tasks in IN PROGRESS"));
        assert!(text.contains("COMPLETED (1)"));
        assert!(text.contains("aaaaaaaa Write report"));
        assert!(text.contains("Today"));
        assert!(text.contains("09 Jun, 2024"));
    }

    #[test]
    fn empty_view_says_so() {
        let parts = ViewCriteria::default().partition(&[]);
        let text = render(|buf| Renderer::plain().write_list(buf, &parts, "", now()));
        assert_eq!(text, "No tasks found.\n");
    }

    #[test]
    fn board_cards_carry_handles() {
        let tasks = tasks();
        let parts = ViewCriteria::default().partition(&tasks);
        let text = render(|buf| Renderer::plain().write_board(buf, &parts, "", now()));

        assert!(text.contains("[TO-DO|aaaaaaaa]"));
        assert!(text.contains("[COMPLETED|bbbbbbbb]"));
        assert!(text.lines().next().unwrap_or("").contains("IN PROGRESS (0)"));
    }

    #[test]
    fn info_lists_activity() {
        let mut task = tasks().remove(0);
        task.activity.push(ActivityItem {
            message: "You changed status from TO-DO to IN-PROGRESS".to_string(),
            timestamp: "2024-06-01T09:30:00.000Z".to_string(),
        });
        let text = render(|buf| Renderer::plain().write_task_info(buf, &task, now()));
        assert!(text.contains("title     Write report"));
        assert!(text.contains("You changed status from TO-DO to IN-PROGRESS"));
    }

    #[test]
    fn clip_respects_width() {
        assert_eq!(clip("short", 10), "short");
        let clipped = clip("a very long title indeed", 10);
        assert!(UnicodeWidthStr::width(clipped.as_str()) <= 10);
        assert!(clipped.ends_with('…'));
    }
}
