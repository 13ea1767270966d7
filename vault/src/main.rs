use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use vault::config::absolutize;
use vault::filter::{AreaFilter, GroupFilter};
use vault::mutation::{BatchResult, NewArea, NewGroup, NewItem};
use vault::session::Indexed;
use vault::{
    Area, AreaStatus, DateValue, Entity, Group, GroupStatus, Item, ItemFilter, ItemStatus, Reference,
    ScanOptions, Session, Validated, Vault, VaultConfig,
};

#[derive(Debug, Parser)]
#[command(
    name = "vault",
    about = "Plain-text items, groups and areas",
    version
)]
struct Cli {
    /// Vault root directory. Defaults to the current directory.
    #[arg(long, global = true, env = "VAULT_ROOT")]
    root: Option<PathBuf>,
    /// Config file to use instead of `<root>/vault.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List items, groups or areas matching the given filters.
    List(ListArgs),

    /// Show one entity by title or path.
    Show(ShowArgs),

    /// Create a new item, group or area.
    New(NewArgs),

    /// Set the status of one or more items.
    Status(StatusArgs),

    /// Mark items done.
    Done(TargetsArgs),

    /// Move items into the archive directory.
    Archive(TargetsArgs),

    /// Move archived items back into the items directory.
    Unarchive(TargetsArgs),

    /// Report files that fail to load and advisory warnings.
    Check(CheckArgs),

    /// Print areas with their groups and items.
    Tree,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Item,
    Group,
    Area,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, value_enum, default_value_t = KindArg::Item)]
    kind: KindArg,
    /// Status to include; repeat for several.
    #[arg(long = "status")]
    statuses: Vec<String>,
    /// Only items in this group (`[[Name]]`, path or filename).
    #[arg(long)]
    group: Option<Reference>,
    /// Only entities in this area.
    #[arg(long)]
    area: Option<Reference>,
    /// Case-insensitive title substring.
    #[arg(long)]
    title: Option<String>,
    /// Open items due before today.
    #[arg(long, conflicts_with_all = ["upcoming", "actionable"])]
    overdue: bool,
    /// Items due within this many days.
    #[arg(long, conflicts_with = "actionable")]
    upcoming: Option<u64>,
    /// Ready or in-progress items that are not deferred.
    #[arg(long)]
    actionable: bool,
    /// Date used as "today" (YYYY-MM-DD).
    #[arg(long)]
    today: Option<NaiveDate>,
    /// Include archived items.
    #[arg(long)]
    archived: bool,
    /// Emit JSON instead of one line per entity.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ShowArgs {
    /// Title (or unique part of it) or file path.
    query: String,
    #[arg(long, value_enum, default_value_t = KindArg::Item)]
    kind: KindArg,
    /// Emit JSON instead of the file text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct NewArgs {
    title: String,
    #[arg(long, value_enum, default_value_t = KindArg::Item)]
    kind: KindArg,
    #[arg(long)]
    status: Option<String>,
    /// Due date or timestamp (items only).
    #[arg(long)]
    due: Option<DateValue>,
    /// Group reference (items only).
    #[arg(long)]
    group: Option<Reference>,
    #[arg(long)]
    area: Option<Reference>,
    /// File name to use instead of one derived from the title.
    #[arg(long)]
    file: Option<String>,
}

#[derive(Debug, Args)]
struct StatusArgs {
    status: ItemStatus,
    /// Item titles or paths.
    #[arg(required = true)]
    targets: Vec<String>,
}

#[derive(Debug, Args)]
struct TargetsArgs {
    /// Item titles or paths.
    #[arg(required = true)]
    targets: Vec<String>,
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Emit JSON instead of a human-readable report.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let vault = open_vault(cli.root.as_deref(), cli.config.as_deref())?;
    match cli.command {
        Commands::List(args) => handle_list(&vault, args),
        Commands::Show(args) => handle_show(&vault, args),
        Commands::New(args) => handle_new(&vault, args),
        Commands::Status(args) => {
            let paths = resolve_items(&vault, &args.targets)?;
            report_batch(vault.set_status_many(&paths, args.status), "updated")
        }
        Commands::Done(args) => {
            let paths = resolve_items(&vault, &args.targets)?;
            report_batch(vault.set_status_many(&paths, ItemStatus::Done), "done")
        }
        Commands::Archive(args) => {
            let paths = resolve_items(&vault, &args.targets)?;
            report_batch(vault.archive_many(&paths), "archived")
        }
        Commands::Unarchive(args) => {
            let paths = resolve_items(&vault, &args.targets)?;
            report_batch(vault.unarchive_many(&paths), "restored")
        }
        Commands::Check(args) => handle_check(&vault, args),
        Commands::Tree => handle_tree(&vault),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    // a second init (tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn open_vault(root: Option<&Path>, config: Option<&Path>) -> Result<Vault> {
    let root = match root {
        Some(root) => root.to_path_buf(),
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let config = match config {
        Some(path) => VaultConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => VaultConfig::discover(&root)
            .with_context(|| format!("loading config under {}", root.display()))?,
    };
    tracing::debug!(items = %config.items_dir.display(), groups = %config.groups_dir.display(), areas = %config.areas_dir.display(), "vault layout");
    Ok(Vault::new(config))
}

fn open_session(vault: &Vault, include_archived: bool) -> Result<Session> {
    vault
        .session_with(ScanOptions { include_archived })
        .context("scanning vault")
}

fn handle_list(vault: &Vault, args: ListArgs) -> Result<()> {
    let session = open_session(vault, args.archived)?;
    let today = args.today.unwrap_or_else(|| Local::now().date_naive());
    match args.kind {
        KindArg::Item => {
            let filter = item_filter(&args, today)?;
            let items: Vec<&Item> = session.filter(&filter);
            emit(&items, args.json, item_line)
        }
        KindArg::Group => {
            let filter = GroupFilter {
                statuses: parse_statuses::<GroupStatus>(&args.statuses)?,
                area: args.area.clone(),
                title_contains: args.title.clone(),
                ..GroupFilter::default()
            };
            let groups: Vec<&Group> = session.filter(&filter);
            emit(&groups, args.json, |group| group_line(&session, group))
        }
        KindArg::Area => {
            let filter = AreaFilter {
                statuses: parse_statuses::<AreaStatus>(&args.statuses)?,
                title_contains: args.title.clone(),
                ..AreaFilter::default()
            };
            let areas: Vec<&Area> = session.filter(&filter);
            emit(&areas, args.json, area_line)
        }
    }
}

fn item_filter(args: &ListArgs, today: NaiveDate) -> Result<ItemFilter> {
    let mut filter = if args.overdue {
        ItemFilter::overdue(today)
    } else if let Some(days) = args.upcoming {
        ItemFilter::upcoming(today, days)
    } else if args.actionable {
        ItemFilter::actionable(today)
    } else {
        ItemFilter::new()
    };
    if let Some(statuses) = parse_statuses::<ItemStatus>(&args.statuses)? {
        filter.statuses = Some(statuses);
    }
    filter.group = args.group.clone();
    filter.area = args.area.clone();
    filter.title_contains = args.title.clone();
    Ok(filter)
}

fn parse_statuses<S>(tokens: &[String]) -> Result<Option<Vec<S>>>
where
    S: std::str::FromStr<Err = String>,
{
    if tokens.is_empty() {
        return Ok(None);
    }
    tokens
        .iter()
        .map(|token| token.parse::<S>().map_err(|err| anyhow!(err)))
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn emit<T: Serialize>(entries: &[&T], json: bool, line: impl Fn(&T) -> String) -> Result<()> {
    let mut out = io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, entries).context("writing JSON")?;
        writeln!(out)?;
    } else {
        for entry in entries {
            writeln!(out, "{}", line(entry))?;
        }
    }
    Ok(())
}

fn item_line(item: &Item) -> String {
    let due = item
        .due
        .map(|due| due.date().to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("{:<12} {:<10}  {}", item.status, due, item.title)
}

fn group_line(session: &Session, group: &Group) -> String {
    let progress = session.group_progress(group);
    let status = group.status.as_ref().map_or("-", |status| status.as_str());
    format!(
        "{:<12} {:>3}/{:<3} {}",
        status,
        progress.done + progress.dropped,
        progress.total,
        group.title
    )
}

fn area_line(area: &Area) -> String {
    let status = area.status.as_ref().map_or("-", |status| status.as_str());
    format!("{:<12} {}", status, area.title)
}

/// An existing file path, or a unique title match.
fn lookup<'s, T: Indexed>(session: &'s Session, query: &str) -> Result<&'s T> {
    let path = Path::new(query);
    if path.is_file() {
        if let Some(found) = session.get::<T>(&absolutize(path)) {
            return Ok(found);
        }
    }
    session
        .find_unique::<T>(query)
        .with_context(|| format!("looking up {} {query:?}", T::KIND))
}

fn handle_show(vault: &Vault, args: ShowArgs) -> Result<()> {
    let session = open_session(vault, true)?;
    match args.kind {
        KindArg::Item => show(lookup::<Item>(&session, &args.query)?, args.json),
        KindArg::Group => show(lookup::<Group>(&session, &args.query)?, args.json),
        KindArg::Area => show(lookup::<Area>(&session, &args.query)?, args.json),
    }
}

fn show<T: Entity + Serialize>(entity: &T, json: bool) -> Result<()> {
    let mut out = io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, entity).context("writing JSON")?;
        writeln!(out)?;
    } else {
        writeln!(out, "# {}", entity.path().display())?;
        write!(out, "{}", entity.render())?;
    }
    Ok(())
}

fn handle_new(vault: &Vault, args: NewArgs) -> Result<()> {
    let NewArgs {
        title,
        kind,
        status,
        due,
        group,
        area,
        file,
    } = args;
    if kind != KindArg::Item && (due.is_some() || group.is_some()) {
        bail!("--due and --group only apply to items");
    }
    let created: (PathBuf, Vec<_>) = match kind {
        KindArg::Item => {
            let status = status.map(|s| s.parse::<ItemStatus>().map_err(|err| anyhow!(err))).transpose()?;
            let item = vault
                .create_item(NewItem {
                    status,
                    due,
                    group,
                    area,
                    filename: file,
                    ..NewItem::new(title)
                })
                .context("creating item")?;
            (item.entity.path, item.warnings)
        }
        KindArg::Group => {
            let status = status.map(|s| s.parse::<GroupStatus>().map_err(|err| anyhow!(err))).transpose()?;
            let group = vault
                .create_group(NewGroup {
                    status,
                    area,
                    filename: file,
                    ..NewGroup::new(title)
                })
                .context("creating group")?;
            (group.entity.path, group.warnings)
        }
        KindArg::Area => {
            let status = status.map(|s| s.parse::<AreaStatus>().map_err(|err| anyhow!(err))).transpose()?;
            let area = vault
                .create_area(NewArea {
                    status,
                    filename: file,
                    ..NewArea::new(title)
                })
                .context("creating area")?;
            (area.entity.path, area.warnings)
        }
    };
    let (path, warnings) = created;
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
    println!("{}", path.display());
    Ok(())
}

/// Resolve every target before changing anything.
fn resolve_items(vault: &Vault, targets: &[String]) -> Result<Vec<PathBuf>> {
    let session = open_session(vault, true)?;
    targets
        .iter()
        .map(|target| lookup::<Item>(&session, target).map(|item| item.path.clone()))
        .collect()
}

fn report_batch(result: BatchResult<Validated<Item>>, verb: &str) -> Result<()> {
    for done in &result.succeeded {
        println!("{verb} {}", done.entity.path.display());
        for warning in &done.warnings {
            eprintln!("warning: {}: {warning}", done.entity.path.display());
        }
    }
    for (path, err) in &result.failed {
        eprintln!("failed {}: {err}", path.display());
    }
    if !result.is_complete() {
        bail!(
            "{} of {} changes failed",
            result.failed.len(),
            result.failed.len() + result.succeeded.len()
        );
    }
    Ok(())
}

fn handle_check(vault: &Vault, args: CheckArgs) -> Result<()> {
    let session = open_session(vault, true)?;
    let mut out = io::stdout().lock();
    if args.json {
        let failures: Vec<_> = session
            .failures()
            .iter()
            .map(|failure| serde_json::json!({ "path": failure.path, "error": failure.error.to_string() }))
            .collect();
        let warnings: Vec<_> = session
            .warnings()
            .iter()
            .map(|(path, warning)| serde_json::json!({ "path": path, "warning": warning }))
            .collect();
        let report = serde_json::json!({ "failures": failures, "warnings": warnings });
        serde_json::to_writer_pretty(&mut out, &report).context("writing JSON")?;
        writeln!(out)?;
    } else {
        for failure in session.failures() {
            writeln!(out, "error   {}: {}", failure.path.display(), failure.error)?;
        }
        for (path, warning) in session.warnings() {
            writeln!(out, "warning {}: {warning}", path.display())?;
        }
        writeln!(
            out,
            "checked {} items, {} groups, {} areas",
            session.items().len(),
            session.groups().len(),
            session.areas().len()
        )?;
    }
    if !session.failures().is_empty() {
        bail!("{} file(s) failed to load", session.failures().len());
    }
    Ok(())
}

fn checkbox(item: &Item) -> &'static str {
    match item.status {
        ItemStatus::Done => "[x]",
        ItemStatus::Dropped => "[-]",
        _ => "[ ]",
    }
}

fn write_group(out: &mut impl Write, session: &Session, group: &Group, indent: &str) -> Result<()> {
    let progress = session.group_progress(group);
    writeln!(
        out,
        "{indent}{} ({}/{})",
        group.title,
        progress.done + progress.dropped,
        progress.total
    )?;
    for item in session.items_in_group(group) {
        writeln!(out, "{indent}  {} {}", checkbox(item), item.title)?;
    }
    Ok(())
}

fn handle_tree(vault: &Vault) -> Result<()> {
    let session = open_session(vault, false)?;
    let mut out = io::stdout().lock();
    for area in session.areas() {
        writeln!(out, "{}", area.title)?;
        for group in session.groups_in_area(area) {
            write_group(&mut out, &session, group, "  ")?;
        }
        for item in session.items_in_area(area) {
            if session.group_of(item).is_none() {
                writeln!(out, "  {} {}", checkbox(item), item.title)?;
            }
        }
    }

    let loose_groups: Vec<&Group> = session
        .groups()
        .iter()
        .filter(|group| session.area_of_group(group).is_none())
        .collect();
    let loose_items: Vec<&Item> = session
        .items()
        .iter()
        .filter(|item| session.group_of(item).is_none() && session.area_of(item).is_none())
        .collect();
    if !loose_groups.is_empty() || !loose_items.is_empty() {
        writeln!(out, "(no area)")?;
        for group in loose_groups {
            write_group(&mut out, &session, group, "  ")?;
        }
        for item in loose_items {
            writeln!(out, "  {} {}", checkbox(item), item.title)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn list_args(argv: &[&str]) -> ListArgs {
        let cli = Cli::try_parse_from(argv).expect("parse");
        match cli.command {
            Commands::List(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    #[test]
    fn list_flags_build_the_preset_plus_extras() {
        let args = list_args(&["vault", "list", "--overdue", "--group", "[[Q1 Plan]]", "--title", "milk"]);
        let filter = item_filter(&args, day(15)).expect("filter");
        assert_eq!(filter.due.before, Some(day(15)));
        assert_eq!(filter.group, Some(Reference::link("Q1 Plan")));
        assert_eq!(filter.title_contains.as_deref(), Some("milk"));
        assert_eq!(filter.statuses, Some(ItemStatus::open()));
    }

    #[test]
    fn explicit_statuses_replace_the_preset_set() {
        let args = list_args(&["vault", "list", "--status", "ready", "--status", "In Progress"]);
        let filter = item_filter(&args, day(1)).expect("filter");
        assert_eq!(filter.statuses, Some(vec![ItemStatus::Ready, ItemStatus::InProgress]));

        let args = list_args(&["vault", "list", "--status", "someday"]);
        assert!(item_filter(&args, day(1)).is_err());
    }

    #[test]
    fn conflicting_presets_are_rejected() {
        assert!(Cli::try_parse_from(["vault", "list", "--overdue", "--upcoming", "3"]).is_err());
        assert!(Cli::try_parse_from(["vault", "new", "x", "--due", "soon"]).is_err());
        assert!(Cli::try_parse_from(["vault", "status", "later", "x"]).is_err());
    }

    #[test]
    fn lookup_accepts_paths_and_titles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = Vault::new(VaultConfig::for_root(dir.path()));
        let created = vault
            .create_item(NewItem::new("Buy milk"))
            .expect("create")
            .into_inner();
        vault.create_item(NewItem::new("Buy bread")).expect("create");

        let session = open_session(&vault, false).expect("session");
        let by_path = lookup::<Item>(&session, &created.path.display().to_string()).expect("path");
        assert_eq!(by_path.title, "Buy milk");
        let by_title = lookup::<Item>(&session, "milk").expect("title");
        assert_eq!(by_title.path, created.path);
        assert!(lookup::<Item>(&session, "buy").is_err());
    }

    #[test]
    fn batch_report_fails_when_anything_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = Vault::new(VaultConfig::for_root(dir.path()));
        let item = vault.create_item(NewItem::new("One")).expect("create").into_inner();
        let missing = vault.config().items_dir.join("missing.md");

        assert!(report_batch(vault.set_status_many([&item.path], ItemStatus::Ready), "updated").is_ok());
        assert!(report_batch(vault.set_status_many([&item.path, &missing], ItemStatus::Done), "done").is_err());
        let text = fs::read_to_string(&item.path).expect("read");
        assert!(text.contains("status: done"));
    }

    #[test]
    fn lines_are_aligned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = Vault::new(VaultConfig::for_root(dir.path()));
        let item = vault
            .create_item(NewItem {
                due: Some("2025-01-15T09:00".parse().expect("date")),
                ..NewItem::new("Buy milk")
            })
            .expect("create")
            .into_inner();
        assert_eq!(item_line(&item), "inbox        2025-01-15  Buy milk");
    }
}
