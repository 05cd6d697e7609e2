use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::accessor::StoreAccessor;
use crate::activity::with_activity;
use crate::backend::TaskBackend;
use crate::cli::Invocation;
use crate::config::Config;
use crate::datetime::parse_due_expr;
use crate::render::Renderer;
use crate::reorder::{DragEnd, DragHandle, DropTarget, plan_drag};
use crate::session::{IdentityProvider, SessionGate};
use crate::task::{Attachment, Category, Status, Task, TaskDraft, TaskId, TaskPatch};
use crate::view::{Debouncer, ViewCriteria};

pub fn known_command_names() -> Vec<&'static str> {
    vec![
        "login", "logout", "whoami", "list", "board", "add", "edit", "status", "delete", "move",
        "reorder", "info", "find", "help", "version",
    ]
}

pub fn expand_command_abbrev<'a>(token: &'a str, known: &[&'a str]) -> Option<&'a str> {
    if known.contains(&token) {
        return Some(token);
    }

    let mut matches = known.iter().copied().filter(|name| name.starts_with(token));
    let first = matches.next()?;
    if matches.next().is_some() {
        None
    } else {
        Some(first)
    }
}

#[instrument(skip(backend, gate, cfg, renderer, inv), fields(command = %inv.command))]
pub fn dispatch<B, P>(
    backend: &mut B,
    gate: &mut SessionGate<P>,
    cfg: &Config,
    renderer: &Renderer,
    inv: Invocation,
) -> anyhow::Result<()>
where
    B: TaskBackend,
    P: IdentityProvider,
{
    let now = Utc::now();
    let command = inv.command.as_str();
    debug!(
        filter = ?inv.filter_terms,
        args = ?inv.command_args,
        "dispatching command"
    );

    match command {
        "help" => return cmd_help(),
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        "login" => return cmd_login(gate, renderer),
        "logout" => return cmd_logout(gate),
        "whoami" => return cmd_whoami(gate, renderer),
        _ => {}
    }

    gate.resolve();
    let uid = gate
        .user()
        .map(|user| user.uid.clone())
        .ok_or_else(|| anyhow!("not signed in; run `taskbuddy login` first"))?;

    let mut accessor = StoreAccessor::new(backend, uid, cfg.order_policy()?);

    match command {
        "list" => {
            accessor.fetch_all();
            cmd_list(&accessor, renderer, &inv.view_terms(), now)
        }
        "board" => {
            accessor.fetch_all();
            cmd_board(&accessor, renderer, &inv.view_terms(), now)
        }
        "find" => {
            accessor.fetch_all();
            cmd_find(&accessor, cfg, renderer, &inv.view_terms(), now)
        }
        "info" => {
            load_strict(&mut accessor)?;
            cmd_info(&accessor, renderer, &inv.command_args, now)
        }
        "add" => {
            load_strict(&mut accessor)?;
            cmd_add(&mut accessor, &inv.command_args, now)
        }
        "edit" => {
            load_strict(&mut accessor)?;
            cmd_edit(&mut accessor, &inv.command_args, now)
        }
        "status" => {
            load_strict(&mut accessor)?;
            cmd_status(&mut accessor, renderer, &inv.command_args)
        }
        "delete" => {
            load_strict(&mut accessor)?;
            cmd_delete(&mut accessor, renderer, &inv.command_args)
        }
        "move" => {
            load_strict(&mut accessor)?;
            cmd_move(&mut accessor, renderer, &inv.command_args)
        }
        "reorder" => {
            load_strict(&mut accessor)?;
            cmd_reorder(&mut accessor, renderer, &inv.command_args)
        }
        other => Err(anyhow!("unknown command: {other}")),
    }
}

fn load_strict<B: TaskBackend>(accessor: &mut StoreAccessor<B>) -> anyhow::Result<()> {
    accessor.try_fetch_all().context("failed to load tasks")?;
    Ok(())
}

#[instrument(skip(gate, renderer))]
fn cmd_login<P: IdentityProvider>(
    gate: &mut SessionGate<P>,
    renderer: &Renderer,
) -> anyhow::Result<()> {
    info!("command login");

    if let Some(user) = gate.resolve_user() {
        println!("Already signed in as {}.", user.label());
        return Ok(());
    }

    let user = gate
        .sign_in()
        .ok_or_else(|| anyhow!("sign-in failed; set identity.id in your taskbuddyrc"))?;
    println!("Signed in.");
    renderer.print_user(user)
}

#[instrument(skip(gate))]
fn cmd_logout<P: IdentityProvider>(gate: &mut SessionGate<P>) -> anyhow::Result<()> {
    info!("command logout");
    gate.logout()?;
    println!("Signed out.");
    Ok(())
}

#[instrument(skip(gate, renderer))]
fn cmd_whoami<P: IdentityProvider>(
    gate: &mut SessionGate<P>,
    renderer: &Renderer,
) -> anyhow::Result<()> {
    match gate.resolve_user() {
        Some(user) => renderer.print_user(user),
        None => {
            println!("Not signed in.");
            Ok(())
        }
    }
}

#[instrument(skip(accessor, renderer, terms, now))]
fn cmd_list<B: TaskBackend>(
    accessor: &StoreAccessor<B>,
    renderer: &Renderer,
    terms: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let criteria = ViewCriteria::from_terms(terms)?;
    let parts = criteria.partition(accessor.tasks());
    debug!(visible = parts.total(), "rendering list");
    renderer.print_list(&parts, &criteria.search, now)
}

#[instrument(skip(accessor, renderer, terms, now))]
fn cmd_board<B: TaskBackend>(
    accessor: &StoreAccessor<B>,
    renderer: &Renderer,
    terms: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let criteria = ViewCriteria::from_terms(terms)?;
    let parts = criteria.partition(accessor.tasks());
    debug!(visible = parts.total(), "rendering board");
    renderer.print_board(&parts, &criteria.search, now)
}

/// Reads search text line by line and re-renders once input has been quiet
/// for the configured debounce. An empty line clears the search; end of input
/// quits.
#[instrument(skip(accessor, cfg, renderer, terms, now))]
fn cmd_find<B: TaskBackend>(
    accessor: &StoreAccessor<B>,
    cfg: &Config,
    renderer: &Renderer,
    terms: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let base = ViewCriteria::from_terms(terms)?;
    let mut debouncer = Debouncer::new(cfg.debounce()?);

    let show = |search: &str| -> anyhow::Result<()> {
        let criteria = base.clone().with_search(search);
        renderer.print_list(&criteria.partition(accessor.tasks()), &criteria.search, now)?;
        eprint!("search> ");
        io::stderr().flush()?;
        Ok(())
    };

    show(&base.search)?;

    let (tx, rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        let received = match debouncer.deadline() {
            Some(deadline) => {
                rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(line) => {
                debug!(query = %line, "search input");
                debouncer.push(line, Instant::now());
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(query) = debouncer.poll(Instant::now()) {
                    show(query.trim())?;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(query) = debouncer.flush() {
                    show(query.trim())?;
                }
                eprintln!();
                break;
            }
        }
    }

    Ok(())
}

#[instrument(skip(accessor, renderer, args, now))]
fn cmd_info<B: TaskBackend>(
    accessor: &StoreAccessor<B>,
    renderer: &Renderer,
    args: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let [token] = args else {
        return Err(anyhow!("info requires exactly one task id"));
    };
    let id = resolve_task_id(accessor.tasks(), token)?;
    let task = lookup(accessor, &id)?;
    renderer.print_task_info(task, now)
}

#[instrument(skip(accessor, args, now))]
fn cmd_add<B: TaskBackend>(
    accessor: &mut StoreAccessor<B>,
    args: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command add");

    let (title, mods) = parse_words_and_mods(args, now)?;

    let mut due = None;
    let mut draft = TaskDraft::new(title, "");
    for one_mod in mods {
        match one_mod {
            Mod::Title(title) => draft.title = title,
            Mod::Due(value) => due = Some(value),
            Mod::Status(status) => draft.status = status,
            Mod::Category(category) => draft.category = category,
            Mod::Desc(description) => draft.description = description,
            Mod::Image(image) => draft.image = image,
        }
    }
    if draft.title.trim().is_empty() {
        return Err(anyhow!("add: a title is required"));
    }
    draft.due_date = due.ok_or_else(|| anyhow!("add: due:<date> is required"))?;

    let task = accessor.add(draft).context("failed to add task")?;
    println!("Created task {}.", task.id.short());
    Ok(())
}

#[instrument(skip(accessor, args, now))]
fn cmd_edit<B: TaskBackend>(
    accessor: &mut StoreAccessor<B>,
    args: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command edit");

    let Some((token, rest)) = args.split_first() else {
        return Err(anyhow!("edit requires a task id"));
    };
    let id = resolve_task_id(accessor.tasks(), token)?;
    let (words, mods) = parse_words_and_mods(rest, now)?;

    let mut patch = TaskPatch::default();
    if !words.is_empty() {
        patch.title = Some(words);
    }
    for one_mod in mods {
        match one_mod {
            Mod::Title(title) => patch.title = Some(title),
            Mod::Due(value) => patch.due_date = Some(value),
            Mod::Status(status) => patch.status = Some(status),
            Mod::Category(category) => patch.category = Some(category),
            Mod::Desc(description) => patch.description = Some(description),
            Mod::Image(image) => patch.image = Some(image),
        }
    }
    if patch.is_empty() {
        return Err(anyhow!("edit: nothing to change"));
    }

    let patch = with_activity(lookup(accessor, &id)?, patch, now);
    accessor
        .edit(&id, patch)
        .with_context(|| format!("failed to edit task {}", id.short()))?;
    println!("Modified task {}.", id.short());
    Ok(())
}

#[instrument(skip(accessor, renderer, args))]
fn cmd_status<B: TaskBackend>(
    accessor: &mut StoreAccessor<B>,
    renderer: &Renderer,
    args: &[String],
) -> anyhow::Result<()> {
    let Some((raw_status, tokens)) = args.split_first() else {
        return Err(anyhow!("status requires a status and at least one task id"));
    };
    let status: Status = raw_status.parse()?;
    let ids = resolve_task_ids(accessor.tasks(), tokens)?;

    let report = accessor.edit_many(&ids, &TaskPatch::status(status));
    renderer.print_batch_report("Updated", &report)?;
    finish_batch(accessor, report.is_complete())
}

#[instrument(skip(accessor, renderer, args))]
fn cmd_delete<B: TaskBackend>(
    accessor: &mut StoreAccessor<B>,
    renderer: &Renderer,
    args: &[String],
) -> anyhow::Result<()> {
    let ids = resolve_task_ids(accessor.tasks(), args)?;
    let report = accessor.remove_many(&ids);
    renderer.print_batch_report("Deleted", &report)?;
    finish_batch(accessor, report.is_complete())
}

/// `move <task> <target>`: the target is another task (drop onto its slot)
/// or a status (drop onto the end of that column).
#[instrument(skip(accessor, renderer, args))]
fn cmd_move<B: TaskBackend>(
    accessor: &mut StoreAccessor<B>,
    renderer: &Renderer,
    args: &[String],
) -> anyhow::Result<()> {
    let [source, target] = args else {
        return Err(anyhow!("move requires a task and a target task or status"));
    };

    let active = DragHandle::row(resolve_task_id(accessor.tasks(), source)?);
    let over = match target.parse::<Status>() {
        Ok(status) => DropTarget::Partition(status),
        Err(_) => DropTarget::Task(DragHandle::row(resolve_task_id(accessor.tasks(), target)?)),
    };

    let plan = plan_drag(
        accessor.tasks(),
        &DragEnd {
            active,
            over: Some(over),
        },
    );
    if plan.is_noop() {
        println!("Nothing to move.");
        return Ok(());
    }

    let report = accessor.apply_order_updates(plan.updates());
    renderer.print_batch_report("Reordered", &report)?;
    finish_batch(accessor, report.is_complete())
}

#[instrument(skip(accessor, renderer, args))]
fn cmd_reorder<B: TaskBackend>(
    accessor: &mut StoreAccessor<B>,
    renderer: &Renderer,
    args: &[String],
) -> anyhow::Result<()> {
    let ids = resolve_task_ids(accessor.tasks(), args)?;
    let report = accessor.reorder_all(&ids);
    renderer.print_batch_report("Reordered", &report)?;
    finish_batch(accessor, report.is_complete())
}

fn finish_batch<B: TaskBackend>(
    accessor: &mut StoreAccessor<B>,
    complete: bool,
) -> anyhow::Result<()> {
    if complete {
        return Ok(());
    }
    if let Err(err) = accessor.reconcile() {
        warn!(error = %err, "reconcile after partial batch failed");
    }
    Err(anyhow!("some writes failed"))
}

fn cmd_help() -> anyhow::Result<()> {
    println!(
        "\
Usage: taskbuddy [-v|-q] [--rc KEY=VALUE] [--taskbuddyrc PATH] [--data DIR] <command> [args]

Session:  login, logout, whoami
Views:    list [filters], board [filters], find [filters], info <id>
Changes:  add <title> due:<date> [status:] [category:] [desc:] [image:]
          edit <id> [title words] [title:] [due:] [status:] [category:] [desc:] [image:]
          status <status> <id>...
          delete <id>...
          move <id> <target id | status>
          reorder <id>...
Filters:  category:work|personal|all  sort:asc|desc|none  <search words>"
    );
    Ok(())
}

fn lookup<'a, B: TaskBackend>(
    accessor: &'a StoreAccessor<B>,
    id: &TaskId,
) -> anyhow::Result<&'a Task> {
    accessor
        .find(id)
        .ok_or_else(|| anyhow!("task not found: {id}"))
}

/// Accepts a full id, any unique id prefix, or a board handle `STATUS|id`.
pub fn resolve_task_id(tasks: &[Task], token: &str) -> anyhow::Result<TaskId> {
    let handle: DragHandle = token.parse()?;
    let needle = handle.id.as_str();

    if let Some(task) = tasks.iter().find(|task| task.id.as_str() == needle) {
        return Ok(task.id.clone());
    }

    let mut matches = tasks
        .iter()
        .filter(|task| task.id.as_str().starts_with(needle));
    let first = matches
        .next()
        .ok_or_else(|| anyhow!("no task matches {token}"))?;
    if matches.next().is_some() {
        return Err(anyhow!("task id {token} is ambiguous"));
    }
    Ok(first.id.clone())
}

fn resolve_task_ids(tasks: &[Task], tokens: &[String]) -> anyhow::Result<Vec<TaskId>> {
    if tokens.is_empty() {
        return Err(anyhow!("at least one task id is required"));
    }
    tokens
        .iter()
        .map(|token| resolve_task_id(tasks, token))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
enum Mod {
    Title(String),
    Due(String),
    Status(Status),
    Category(Category),
    Desc(Option<String>),
    Image(Option<Attachment>),
}

/// Splits arguments into free words and `key:value` modifiers. Everything
/// after `--` is taken as words.
fn parse_words_and_mods(
    args: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<(String, Vec<Mod>)> {
    let mut words = Vec::new();
    let mut mods = Vec::new();

    let mut literal = false;
    for arg in args {
        if arg == "--" {
            literal = true;
            continue;
        }

        if !literal && let Some(one_mod) = parse_one_mod(arg, now)? {
            mods.push(one_mod);
            continue;
        }

        words.push(arg.as_str());
    }

    Ok((words.join(" ").trim().to_string(), mods))
}

fn parse_one_mod(tok: &str, now: DateTime<Utc>) -> anyhow::Result<Option<Mod>> {
    let Some((key, value)) = tok.split_once(':') else {
        return Ok(None);
    };
    let value = value.trim();

    let parsed = match key.to_ascii_lowercase().as_str() {
        "title" => Mod::Title(value.to_string()),
        "due" => Mod::Due(parse_due_expr(value, now)?),
        "status" => Mod::Status(value.parse()?),
        "category" | "cat" => Mod::Category(value.parse()?),
        "desc" | "description" => {
            Mod::Desc(Some(value.to_string()).filter(|text| !text.is_empty()))
        }
        "image" => Mod::Image(parse_attachment(value)),
        _ => return Ok(None),
    };
    Ok(Some(parsed))
}

fn parse_attachment(value: &str) -> Option<Attachment> {
    if value.is_empty() {
        return None;
    }
    if ["http://", "https://", "file://", "memory://"]
        .iter()
        .any(|scheme| value.starts_with(scheme))
    {
        Some(Attachment::Remote(value.to_string()))
    } else {
        Some(Attachment::Local(PathBuf::from(value)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::session::ProfileIdentity;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn invocation(command: &str, args: &[&str]) -> Invocation {
        Invocation {
            filter_terms: vec![],
            command: command.to_string(),
            command_args: strings(args),
        }
    }

    fn task(id: &str) -> Task {
        TaskDraft::new(id, "2024-06-01").into_task(TaskId::new(id), 0)
    }

    #[test]
    fn abbreviations_must_be_unique() {
        let known = known_command_names();
        assert_eq!(expand_command_abbrev("bo", &known), Some("board"));
        assert_eq!(expand_command_abbrev("log", &known), None);
        assert_eq!(expand_command_abbrev("logi", &known), Some("login"));
        assert_eq!(expand_command_abbrev("zz", &known), None);
    }

    #[test]
    fn resolves_prefixes_and_handles() {
        let tasks = vec![task("abc123"), task("abd456")];
        assert_eq!(resolve_task_id(&tasks, "abc").unwrap(), TaskId::new("abc123"));
        assert_eq!(
            resolve_task_id(&tasks, "IN-PROGRESS|abd").unwrap(),
            TaskId::new("abd456")
        );
        assert!(resolve_task_id(&tasks, "ab").is_err());
        assert!(resolve_task_id(&tasks, "zzz").is_err());
    }

    #[test]
    fn splits_words_from_modifiers() {
        let (words, mods) = parse_words_and_mods(
            &strings(&[
                "Pay",
                "rent",
                "due:tomorrow",
                "category:personal",
                "desc:",
                "image:https://x/y.png",
                "--",
                "status:later",
            ]),
            now(),
        )
        .unwrap();

        assert_eq!(words, "Pay rent status:later");
        assert_eq!(
            mods,
            vec![
                Mod::Due("2024-06-02T00:00:00.000Z".to_string()),
                Mod::Category(Category::Personal),
                Mod::Desc(None),
                Mod::Image(Some(Attachment::Remote("https://x/y.png".to_string()))),
            ]
        );
        assert!(parse_one_mod("status:later", now()).is_err());
        assert_eq!(parse_one_mod("note:x", now()).unwrap(), None);
    }

    #[test]
    fn commands_require_a_session() {
        let temp = tempdir().expect("tempdir");
        let mut backend = MemoryBackend::new();
        let mut gate = SessionGate::new(ProfileIdentity::new(temp.path().join("session.json"), None));
        let cfg = Config::default();

        let err = dispatch(&mut backend, &mut gate, &cfg, &Renderer::plain(), invocation("list", &[]))
            .expect_err("signed out");
        assert!(err.to_string().contains("not signed in"));

        dispatch(&mut backend, &mut gate, &cfg, &Renderer::plain(), invocation("help", &[]))
            .expect("help is always allowed");
    }

    #[test]
    fn add_edit_move_through_dispatch() {
        let temp = tempdir().expect("tempdir");
        let mut cfg = Config::default();
        cfg.set("identity.id", "uid-1");
        let provider = ProfileIdentity::from_config(&cfg, temp.path().join("session.json"));
        let mut gate = SessionGate::new(provider);
        let mut backend = MemoryBackend::new();
        let renderer = Renderer::plain();

        dispatch(&mut backend, &mut gate, &cfg, &renderer, invocation("login", &[])).expect("login");
        for title in ["first", "second"] {
            dispatch(
                &mut backend,
                &mut gate,
                &cfg,
                &renderer,
                invocation("add", &[title, "due:2024-06-05"]),
            )
            .expect("add");
        }

        let tasks = backend.list_by_owner("uid-1").expect("list");
        let first = tasks.iter().find(|t| t.title == "first").unwrap().id.clone();
        let second = tasks.iter().find(|t| t.title == "second").unwrap().id.clone();

        dispatch(
            &mut backend,
            &mut gate,
            &cfg,
            &renderer,
            invocation("edit", &[first.short(), "status:progress"]),
        )
        .expect("edit");
        let edited = backend.record("uid-1", &first).unwrap();
        assert_eq!(edited.status, Status::InProgress);
        assert_eq!(
            edited.activity[0].message,
            "You changed status from TO-DO to IN-PROGRESS"
        );

        dispatch(
            &mut backend,
            &mut gate,
            &cfg,
            &renderer,
            invocation("move", &[second.short(), first.short()]),
        )
        .expect("move");
        let moved = backend.record("uid-1", &second).unwrap();
        assert_eq!(moved.status, Status::InProgress);
        assert_eq!(moved.order, 0);
        assert_eq!(backend.record("uid-1", &first).unwrap().order, 1);
    }

    #[test]
    fn add_accepts_title_modifier() {
        let temp = tempdir().expect("tempdir");
        let mut cfg = Config::default();
        cfg.set("identity.id", "uid-1");
        let provider = ProfileIdentity::from_config(&cfg, temp.path().join("session.json"));
        let mut gate = SessionGate::new(provider);
        let mut backend = MemoryBackend::new();
        let renderer = Renderer::plain();

        dispatch(&mut backend, &mut gate, &cfg, &renderer, invocation("login", &[])).expect("login");
        dispatch(
            &mut backend,
            &mut gate,
            &cfg,
            &renderer,
            invocation("add", &["title:Groceries", "due:2024-06-01"]),
        )
        .expect("add with title modifier");

        let err = dispatch(
            &mut backend,
            &mut gate,
            &cfg,
            &renderer,
            invocation("add", &["title:", "due:2024-06-01"]),
        )
        .expect_err("blank title");
        assert!(format!("{err:#}").contains("title is required"));

        let titles: Vec<String> = backend
            .list_by_owner("uid-1")
            .expect("list")
            .into_iter()
            .map(|task| task.title)
            .collect();
        assert_eq!(titles, vec!["Groceries".to_string()]);
    }
}
