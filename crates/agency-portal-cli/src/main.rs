use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agency_portal_core::{
    DateRange, FeatureKey, QueryContext, RecordKey, SessionKey, SessionStore, SortDirection,
    SortSpec, TenantId, TriState, ViewKind,
};
use agency_portal_engine::{EngineConfig, FailurePolicy, FixtureSource, SessionContext, ViewEngine};
use agency_portal_store_sqlite::SqliteSessionStore;
use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "portal.cli.v1";
const LOG_FILTER_ENV: &str = "PORTAL_LOG";

#[derive(Debug, Parser)]
#[command(name = "portal")]
#[command(about = "Multi-tenant agency portal CLI")]
struct Cli {
    #[arg(long, default_value = "./agency_portal.sqlite3")]
    db: PathBuf,

    /// JSON fixture standing in for the tenant backends.
    #[arg(long)]
    fixture: Option<PathBuf>,

    #[arg(long, default_value = "local")]
    user: String,

    /// Engine settings in YAML.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Tenants {
        #[command(subcommand)]
        command: TenantsCommand,
    },
    View {
        #[command(subcommand)]
        command: Box<ViewCommand>,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum TenantsCommand {
    List,
    Select(SelectArgs),
    All,
    Clear,
}

#[derive(Debug, Args)]
struct SelectArgs {
    #[arg(long = "id", required = true)]
    ids: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum ViewCommand {
    Show(ShowArgs),
    Reset(ScopeArgs),
    Export(ExportArgs),
    Delete(DeleteArgs),
    Update(UpdateArgs),
}

#[derive(Debug, Args)]
struct ScopeArgs {
    #[arg(long, value_parser = parse_view)]
    view: ViewKind,
    #[arg(long, value_parser = parse_date)]
    from: Option<Date>,
    #[arg(long, value_parser = parse_date)]
    to: Option<Date>,
    /// Seed the category filter, as when opening a view from a summary card.
    #[arg(long)]
    category: Option<String>,
    #[arg(long, default_value_t = false)]
    best_effort: bool,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long)]
    search: Option<String>,
    /// `field=value`; repeat to allow several values, `field=` clears the facet.
    #[arg(long = "facet")]
    facets: Vec<String>,
    /// `field=all|yes|no`.
    #[arg(long = "toggle")]
    toggles: Vec<String>,
    /// `key`, `key:asc` or `key:desc`.
    #[arg(long)]
    sort: Option<String>,
    #[arg(long)]
    page: Option<usize>,
    #[arg(long)]
    rows: Option<usize>,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long, default_value_t = false)]
    all_matching: bool,
    #[arg(long = "key")]
    keys: Vec<String>,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long)]
    key: String,
    #[arg(long)]
    reason: String,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long)]
    key: String,
    /// JSON object of fields to change.
    #[arg(long)]
    patch: String,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Entries,
    Purge(DbPurgeArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbPurgeArgs {
    /// Purge every user's entries not written for this many days instead of the
    /// current user's entries.
    #[arg(long)]
    older_than_days: Option<u32>,
}

#[derive(Debug, Serialize)]
struct TenantListing {
    id: TenantId,
    name: String,
    features: BTreeSet<FeatureKey>,
    selected: bool,
}

struct Workspace {
    settings: EngineConfig,
    source: Arc<FixtureSource>,
    store: Arc<SqliteSessionStore>,
    user: String,
}

impl Workspace {
    fn open(cli_fixture: Option<&Path>, config: Option<&Path>, store: SqliteSessionStore, user: &str) -> Result<Self> {
        let fixture = cli_fixture.context("--fixture is required for this command")?;
        let source = FixtureSource::load(fixture)?;
        let settings = match config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        store.migrate()?;
        tracing::debug!(fixture = %fixture.display(), policy = ?settings.failure_policy, "workspace opened");
        Ok(Self { settings, source: Arc::new(source), store: Arc::new(store), user: user.to_string() })
    }

    async fn engine(
        &self,
        kind: ViewKind,
        context: QueryContext,
        best_effort: bool,
    ) -> Result<ViewEngine<FixtureSource>> {
        let mut settings = self.settings.clone();
        if best_effort {
            settings.failure_policy = FailurePolicy::BestEffort;
        }
        let session = SessionContext::from_grant(self.user.clone(), self.source.as_ref()).await?;
        let store: Arc<dyn SessionStore> = self.store.clone();
        Ok(ViewEngine::new(
            settings.view_config(kind),
            &settings,
            Arc::clone(&self.source),
            store,
            session,
            context,
        ))
    }

    async fn scoped_engine(&self, scope: &ScopeArgs) -> Result<ViewEngine<FixtureSource>> {
        let context = query_context(&self.settings, scope)?;
        self.engine(scope.view, context, scope.best_effort).await
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let store = SqliteSessionStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(command, &store, &cli.user),
        Command::Tenants { command } => {
            let workspace =
                Workspace::open(cli.fixture.as_deref(), cli.config.as_deref(), store, &cli.user)?;
            run_tenants(command, &workspace).await
        }
        Command::View { command } => {
            let workspace =
                Workspace::open(cli.fixture.as_deref(), cli.config.as_deref(), store, &cli.user)?;
            run_view(*command, &workspace).await
        }
    }
}

async fn run_tenants(command: TenantsCommand, workspace: &Workspace) -> Result<()> {
    let context = QueryContext::new(current_month(&workspace.settings)?);
    let engine = workspace.engine(ViewKind::Commissions, context, false).await?;
    match command {
        TenantsCommand::List => {}
        TenantsCommand::Select(args) => {
            let ids = args.ids.iter().map(|id| TenantId::new(id.trim())).collect::<Vec<_>>();
            engine.select_tenants(&ids)?;
        }
        TenantsCommand::All => engine.select_all_tenants(),
        TenantsCommand::Clear => engine.clear_tenants(),
    }

    let selected = engine.selected_tenants();
    let tenants = engine
        .catalog()
        .iter()
        .map(|tenant| TenantListing {
            id: tenant.id.clone(),
            name: tenant.name.clone(),
            features: tenant.features.clone(),
            selected: selected.contains(&tenant.id),
        })
        .collect::<Vec<_>>();
    emit_json(serde_json::json!({
        "user": workspace.user,
        "selected": selected,
        "tenants": tenants
    }))
}

async fn run_view(command: ViewCommand, workspace: &Workspace) -> Result<()> {
    match command {
        ViewCommand::Show(args) => run_view_show(&args, workspace).await,
        ViewCommand::Reset(scope) => {
            let engine = workspace.scoped_engine(&scope).await?;
            engine.reset_filters();
            emit_json(serde_json::json!({
                "view": scope.view,
                "view_state": engine.view_state()
            }))
        }
        ViewCommand::Export(args) => run_view_export(&args, workspace).await,
        ViewCommand::Delete(args) => {
            let engine = workspace.scoped_engine(&args.scope).await?;
            engine.refresh().await?;
            let outcome = engine.delete_record(&RecordKey(args.key.clone()), &args.reason).await?;
            emit_json(serde_json::json!({
                "deleted": args.key,
                "refresh": outcome,
                "total_records": engine.snapshot().total_records
            }))
        }
        ViewCommand::Update(args) => {
            let patch: Value = serde_json::from_str(&args.patch).context("--patch must be JSON")?;
            let engine = workspace.scoped_engine(&args.scope).await?;
            engine.refresh().await?;
            let key = RecordKey(args.key.clone());
            let outcome = engine.update_record(&key, patch).await?;
            let record = engine.records().into_iter().find(|record| record.key == key);
            emit_json(serde_json::json!({
                "updated": args.key,
                "refresh": outcome,
                "record": record
            }))
        }
    }
}

async fn run_view_show(args: &ShowArgs, workspace: &Workspace) -> Result<()> {
    let engine = workspace.scoped_engine(&args.scope).await?;
    apply_show_args(&engine, args)?;

    let refresh = engine.refresh().await;
    let snapshot =
        serde_json::to_value(engine.snapshot()).context("failed to serialize view snapshot")?;
    match refresh {
        Ok(outcome) => emit_json(serde_json::json!({ "refresh": outcome, "snapshot": snapshot })),
        Err(err) => {
            emit_json(serde_json::json!({ "refresh": Value::Null, "snapshot": snapshot }))?;
            Err(anyhow!(err).context("refresh failed"))
        }
    }
}

fn apply_show_args(engine: &ViewEngine<FixtureSource>, args: &ShowArgs) -> Result<()> {
    if let Some(term) = &args.search {
        engine.set_search_term(term.clone());
    }
    for (field, values) in parse_facets(&args.facets)? {
        engine.set_facet(&field, values)?;
    }
    for raw in &args.toggles {
        let (field, mode) = parse_toggle(raw)?;
        engine.set_toggle(&field, mode)?;
    }
    if let Some(raw) = &args.sort {
        engine.set_sort(Some(parse_sort(raw)?))?;
    }
    if let Some(rows) = args.rows {
        engine.set_rows_per_page(rows)?;
    }
    if let Some(page) = args.page {
        engine.set_page(page);
    }
    Ok(())
}

async fn run_view_export(args: &ExportArgs, workspace: &Workspace) -> Result<()> {
    if !args.all_matching && args.keys.is_empty() {
        bail!("nothing to export; pass --key or --all-matching");
    }
    let engine = workspace.scoped_engine(&args.scope).await?;
    engine.refresh().await?;
    if args.all_matching {
        engine.select_all_matching();
    }
    let keys = args.keys.iter().map(|key| RecordKey(key.trim().to_string())).collect::<BTreeSet<_>>();
    for key in &keys {
        if !engine.selected_keys().contains(key) {
            engine.toggle_record(key)?;
        }
    }
    print!("{}", engine.export_selected()?);
    Ok(())
}

fn run_db(command: DbCommand, store: &SqliteSessionStore, user: &str) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Entries => {
            store.migrate()?;
            let entries = store.list_entries(&SessionKey::user_prefix(user))?;
            emit_json(serde_json::json!({ "user": user, "entries": entries }))
        }
        DbCommand::Purge(args) => {
            store.migrate()?;
            let removed = match args.older_than_days {
                Some(days) => {
                    let cutoff = OffsetDateTime::now_utc() - Duration::days(i64::from(days));
                    store.purge_older_than(cutoff)?
                }
                None => store.purge_prefix(&SessionKey::user_prefix(user))?,
            };
            emit_json(serde_json::json!({
                "removed": removed,
                "older_than_days": args.older_than_days,
                "user": args.older_than_days.is_none().then_some(user)
            }))
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &SqliteSessionStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn current_month(settings: &EngineConfig) -> Result<DateRange> {
    Ok(DateRange::month_of(OffsetDateTime::now_utc(), settings.utc_offset()?)?)
}

fn query_context(settings: &EngineConfig, scope: &ScopeArgs) -> Result<QueryContext> {
    let range = match (scope.from, scope.to) {
        (Some(from), Some(to)) => DateRange::for_days(from, to, settings.utc_offset()?)?,
        (None, None) => current_month(settings)?,
        _ => bail!("--from and --to must be given together"),
    };
    let context = QueryContext::new(range);
    Ok(match &scope.category {
        Some(category) => context.with_category(category.clone()),
        None => context,
    })
}

fn parse_view(raw: &str) -> Result<ViewKind, String> {
    ViewKind::parse(raw).ok_or_else(|| {
        let known = ViewKind::ALL.iter().map(|kind| kind.as_str()).collect::<Vec<_>>();
        format!("unknown view `{raw}`; expected one of {}", known.join(", "))
    })
}

fn parse_date(raw: &str) -> Result<Date, String> {
    Date::parse(raw.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|err| format!("expected YYYY-MM-DD: {err}"))
}

fn split_assignment<'a>(raw: &'a str, flag: &str) -> Result<(&'a str, &'a str)> {
    let (field, value) =
        raw.split_once('=').ok_or_else(|| anyhow!("--{flag} expects field=value, got `{raw}`"))?;
    let field = field.trim();
    if field.is_empty() {
        bail!("--{flag} expects a field name before `=`");
    }
    Ok((field, value.trim()))
}

fn parse_facets(raw: &[String]) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let mut facets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for entry in raw {
        let (field, value) = split_assignment(entry, "facet")?;
        let values = facets.entry(field.to_string()).or_default();
        if !value.is_empty() {
            values.insert(value.to_string());
        }
    }
    Ok(facets)
}

fn parse_toggle(raw: &str) -> Result<(String, TriState)> {
    let (field, value) = split_assignment(raw, "toggle")?;
    let mode = TriState::parse(value)
        .ok_or_else(|| anyhow!("--toggle {field} expects all, yes or no, got `{value}`"))?;
    Ok((field.to_string(), mode))
}

fn parse_sort(raw: &str) -> Result<SortSpec> {
    let (key, direction) = match raw.split_once(':') {
        Some((key, direction)) => (
            key.trim(),
            SortDirection::parse(direction)
                .ok_or_else(|| anyhow!("--sort direction must be asc or desc, got `{direction}`"))?,
        ),
        None => (raw.trim(), SortDirection::Asc),
    };
    if key.is_empty() {
        bail!("--sort expects a column name");
    }
    Ok(SortSpec::new(key, direction))
}
