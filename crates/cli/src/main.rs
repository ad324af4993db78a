use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kiln_core::object::{labels, meta};
use kiln_core::{Blueprint, Json, ObjectKey, ObjectStore, Owner, Repository, Template, Trigger, TypeKey};
use kiln_eval::JsonPath;
use kiln_kubehub::{owner_trigger, resync_trigger, spawn_watch, stamped_trigger, KubeEvents, KubeRepository, KubeStore, Resources};
use kiln_reconciler::{Config, Controller, Reconciler};
use kiln_stamp::{parse_documents, render, Context as RenderContext, Stamp};
use kiln_store::{MemoryEvents, MemoryRepository, MemoryStore};
use tokio::{signal, sync::mpsc, task::JoinHandle};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kilnctl", version, about = "Kiln declarative orchestration engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch (default: all namespaces)
    #[arg(long = "ns", global = true, env = "KILN_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show which blueprint(s) an owner selects
    Match {
        /// Owner manifest (YAML or JSON)
        #[arg(long)]
        owner: PathBuf,
        /// Manifests containing blueprints
        #[arg(short = 'f', long = "file", required = true)]
        files: Vec<PathBuf>,
    },
    /// Render one template against an owner
    Render {
        #[arg(long)]
        owner: PathBuf,
        /// Template manifest
        #[arg(long)]
        template: PathBuf,
        /// Param override, `name=value` (value parsed as JSON when possible)
        #[arg(long = "param")]
        params: Vec<String>,
        /// Config input, `name=value`
        #[arg(long = "config")]
        configs: Vec<String>,
        /// Resource name used in labels and generated names
        #[arg(long, default_value = "resource")]
        resource: String,
    },
    /// Reconcile an owner against manifests in an in-memory store
    Simulate {
        #[arg(long)]
        owner: PathBuf,
        /// Manifests containing blueprints and templates
        #[arg(short = 'f', long = "file", required = true)]
        files: Vec<PathBuf>,
        /// Reconcile cycles to run
        #[arg(long, default_value_t = 3)]
        cycles: u32,
        /// Mark stamped objects healthy between cycles (Ready and Succeeded True)
        #[arg(long = "mark-healthy", action = ArgAction::SetTrue)]
        mark_healthy: bool,
    },
    /// Run the controller against the current cluster
    Run {
        /// Owner GVK key, e.g. "kiln.dev/v1alpha1/Workload"
        #[arg(long = "owner-gvk", env = "KILN_OWNER_GVK", default_value = "kiln.dev/v1alpha1/Workload")]
        owner_gvk: String,
        /// Blueprint GVK key
        #[arg(long = "blueprint-gvk", env = "KILN_BLUEPRINT_GVK", default_value = "kiln.dev/v1alpha1/Blueprint")]
        blueprint_gvk: String,
        /// API group/version of template kinds
        #[arg(long = "template-group-version", env = "KILN_TEMPLATE_GROUP_VERSION", default_value = "kiln.dev/v1alpha1")]
        template_group_version: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KILN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KILN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KILN_METRICS_ADDR; expected host:port");
        }
    }
}

fn load(paths: &[PathBuf]) -> Result<Vec<Json>> {
    let mut out = Vec::new();
    for p in paths {
        out.extend(load_one(p)?);
    }
    Ok(out)
}

fn load_one(path: &Path) -> Result<Vec<Json>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_documents(&text).with_context(|| format!("parsing {}", path.display()))
}

fn single(path: &Path) -> Result<Json> {
    load_one(path)?.into_iter().next().ok_or_else(|| anyhow!("{} contains no documents", path.display()))
}

/// `name=value`; the value is JSON when it parses, a plain string otherwise.
fn parse_assignment(s: &str) -> Result<(String, Json)> {
    let (k, v) = s.split_once('=').ok_or_else(|| anyhow!("expected name=value, got {}", s))?;
    let value = serde_json::from_str(v).unwrap_or_else(|_| Json::String(v.to_string()));
    Ok((k.to_string(), value))
}

fn print_doc(output: Output, v: &Json) -> Result<()> {
    match output {
        Output::Human => print!("{}", serde_yaml::to_string(v)?),
        Output::Json => println!("{}", serde_json::to_string_pretty(v)?),
    }
    Ok(())
}

fn owner_of(raw: Json) -> Result<Owner> {
    Owner::from_object(raw).ok_or_else(|| anyhow!("owner manifest needs apiVersion, kind and metadata.name"))
}

fn cmd_match(output: Output, owner: &Path, files: &[PathBuf], cfg: &Config) -> Result<()> {
    let owner = owner_of(single(owner)?)?;
    let blueprints: Vec<Blueprint> = load(files)?
        .iter()
        .filter(|d| d.get("kind").and_then(|k| k.as_str()) == Some(cfg.blueprint_kind.as_str()))
        .map(Blueprint::from_manifest)
        .collect::<Result<_, _>>()?;
    let report = kiln_selector::best_match(&JsonPath::new(), &owner, &blueprints);
    let winners: Vec<&str> = report.winners.iter().map(|i| blueprints[*i].name.as_str()).collect();
    match output {
        Output::Human => {
            if winners.is_empty() {
                println!("no {} matched {}", cfg.blueprint_kind, owner.key);
            }
            for w in winners.iter() {
                println!("{} • {}", cfg.blueprint_kind, w);
            }
            for e in report.errors.iter() {
                println!("error • [{}] {} • {}", e.index, e.name, e.kind);
            }
        }
        Output::Json => {
            let errors: Vec<Json> = report
                .errors
                .iter()
                .map(|e| serde_json::json!({ "index": e.index, "name": e.name, "message": e.kind.to_string() }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "winners": winners, "errors": errors }))?);
        }
    }
    Ok(())
}

fn cmd_render(output: Output, owner: &Path, template: &Path, params: &[String], configs: &[String], resource: &str) -> Result<()> {
    let owner = owner_of(single(owner)?)?;
    let template = Template::from_manifest(&single(template)?)?;
    let mut merged: BTreeMap<String, Json> = template.spec.params.iter().map(|p| (p.name.clone(), p.default.clone())).collect();
    merged.extend(owner.params());
    for p in params {
        let (k, v) = parse_assignment(p)?;
        merged.insert(k, v);
    }
    let mut wired = BTreeMap::new();
    for c in configs {
        let (k, v) = parse_assignment(c)?;
        wired.insert(k, Some(v));
    }
    let ctx = RenderContext { owner: Some(&owner.raw), params: merged, configs: wired };
    let mut obj = render(&JsonPath::new(), &template.spec.template, &ctx)?;
    Stamp {
        owner: &owner.key,
        owner_uid: &owner.uid,
        blueprint: "local",
        resource,
        template_kind: &template.kind,
        template_name: &template.name,
        lifecycle: template.spec.lifecycle,
    }
    .apply(&mut obj);
    print_doc(output, &obj)
}

async fn cmd_simulate(output: Output, owner: &Path, files: &[PathBuf], cycles: u32, mark_healthy: bool, cfg: Config) -> Result<()> {
    let docs = load(files)?;
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(MemoryRepository::from_documents(&docs, &cfg.blueprint_kind));
    let events = Arc::new(MemoryEvents::new());
    let rec = Reconciler::new(store.clone(), repo, events.clone(), Arc::new(JsonPath::new()), cfg);

    let created = store.create(single(owner)?).await?;
    let key = ObjectKey::of(&created).ok_or_else(|| anyhow!("owner manifest needs apiVersion, kind and metadata.name"))?;
    let uid = meta::str_field(&created, "uid").unwrap_or_default().to_string();

    for cycle in 0..cycles {
        let out = rec.reconcile(&key).await?;
        info!(cycle, written = out.status_written, requeue = ?out.requeue_after, "simulate: cycle");
        if mark_healthy {
            for obj in store.snapshot().iter().filter(|o| meta::label(o, labels::OWNER_UID) == Some(uid.as_str())) {
                if obj.get("status").is_some() {
                    continue;
                }
                let Some(k) = ObjectKey::of(obj) else { continue };
                let conds = serde_json::json!({ "conditions": [
                    { "type": "Ready", "status": "True" },
                    { "type": "Succeeded", "status": "True" }
                ] });
                store.set_status(&k, conds)?;
            }
        }
    }

    let owner = store.get(&key).await?.ok_or_else(|| anyhow!("owner disappeared"))?;
    let stamped: Vec<Json> =
        store.snapshot().into_iter().filter(|o| meta::label(o, labels::OWNER_UID) == Some(uid.as_str())).collect();
    let recorded: Vec<Json> = events
        .all()
        .iter()
        .map(|e| serde_json::json!({ "reason": e.reason, "note": e.note, "regarding": e.regarding.to_string() }))
        .collect();
    match output {
        Output::Human => {
            println!("# status of {}", key);
            print_doc(output, owner.get("status").unwrap_or(&Json::Null))?;
            for o in stamped.iter() {
                if let Some(k) = ObjectKey::of(o) {
                    println!("# stamped {}", k);
                }
            }
            for e in events.all() {
                println!("# event {} • {}", e.reason, e.note);
            }
        }
        Output::Json => {
            let all = serde_json::json!({ "owner": owner, "stamped": stamped, "events": recorded });
            println!("{}", serde_json::to_string_pretty(&all)?);
        }
    }
    Ok(())
}

fn supervise(what: String, h: JoinHandle<Result<()>>) {
    tokio::spawn(async move {
        match h.await {
            Ok(Ok(())) => info!(watch = %what, "watcher finished"),
            Ok(Err(e)) => error!(watch = %what, error = ?e, "watcher failed"),
            Err(e) => error!(watch = %what, error = %e, "watcher task panicked"),
        }
    });
}

/// Literal `{apiVersion, kind}` of every template a blueprint references.
async fn stamped_types(repo: &dyn Repository) -> Result<(BTreeSet<String>, BTreeSet<TypeKey>)> {
    let mut template_kinds = BTreeSet::new();
    let mut types = BTreeSet::new();
    for bp in repo.blueprints().await? {
        for res in bp.spec.resources.iter() {
            let r = &res.template_ref;
            template_kinds.insert(r.kind.clone());
            let names: Vec<String> = r.name.iter().cloned().chain(r.options.iter().map(|o| o.name.clone())).collect();
            for name in names {
                let Some(t) = repo.template(&r.kind, &name).await? else { continue };
                match TypeKey::of(&t.spec.template) {
                    Some(ty) if !ty.api_version.contains("$(") && !ty.kind.contains("$(") => {
                        types.insert(ty);
                    }
                    _ => warn!(template = %t.name, "run: stamped type is templated; not watched"),
                }
            }
        }
    }
    Ok((template_kinds, types))
}

/// Template kinds and stamped types with a running watcher.
#[derive(Debug, Default)]
struct Watched {
    template_kinds: BTreeSet<String>,
    types: BTreeSet<TypeKey>,
}

impl Watched {
    /// Record `kinds` and `types`, returning those not seen before.
    fn add(&mut self, kinds: BTreeSet<String>, types: BTreeSet<TypeKey>) -> (Vec<String>, Vec<TypeKey>) {
        let kinds = kinds.into_iter().filter(|k| self.template_kinds.insert(k.clone())).collect();
        let types = types.into_iter().filter(|t| self.types.insert(t.clone())).collect();
        (kinds, types)
    }
}

struct Watchers {
    resources: Resources,
    namespace: Option<String>,
    owner_ty: TypeKey,
    template_gv: String,
    controller_tx: mpsc::Sender<Trigger>,
    /// Blueprint and template watchers report here.
    catalog_tx: mpsc::Sender<Trigger>,
    watched: Watched,
}

impl Watchers {
    /// Start watchers for template kinds and stamped types that blueprints
    /// reference but nothing watches yet.
    async fn refresh(&mut self, repo: &dyn Repository) -> Result<()> {
        let (kinds, types) = stamped_types(repo).await?;
        let (kinds, types) = self.watched.add(kinds, types);
        for kind in kinds {
            let ty = TypeKey::new(self.template_gv.clone(), kind);
            supervise(ty.to_string(), spawn_watch(self.resources.clone(), ty, None, None, self.catalog_tx.clone(), resync_trigger()));
        }
        for ty in types {
            info!(ty = %ty, "run: watching stamped kind");
            let sel = Some(labels::OWNER_KIND.to_string());
            let h = spawn_watch(
                self.resources.clone(),
                ty.clone(),
                self.namespace.clone(),
                sel,
                self.controller_tx.clone(),
                stamped_trigger(self.owner_ty.clone()),
            );
            supervise(ty.to_string(), h);
        }
        Ok(())
    }
}

/// Forward blueprint/template changes to the controller as a resync and pick
/// up stamped kinds they introduce. Bursts (watch restarts) collapse into one pass.
async fn follow_catalog(mut watchers: Watchers, repo: Arc<KubeRepository>, mut rx: mpsc::Receiver<Trigger>) {
    while let Some(t) = rx.recv().await {
        while rx.try_recv().is_ok() {}
        if watchers.controller_tx.send(t).await.is_err() {
            return;
        }
        if let Err(e) = watchers.refresh(repo.as_ref()).await {
            warn!(error = %e, "run: refreshing watched kinds failed");
        }
    }
}

async fn cmd_run(namespace: Option<String>, owner_gvk: &str, blueprint_gvk: &str, template_gv: &str, cfg: Config) -> Result<()> {
    let owner_ty = kiln_kubehub::type_key(owner_gvk)?;
    let blueprint_ty = kiln_kubehub::type_key(blueprint_gvk)?;
    let client = kube::Client::try_default().await?;
    let resources = Resources::new(client.clone());
    let kube_store = KubeStore::new(resources.clone());
    let repo = Arc::new(KubeRepository::new(kube_store.clone(), blueprint_ty.clone(), template_gv));
    let events = Arc::new(KubeEvents::new(client, "kiln-controller"));
    let store: Arc<dyn ObjectStore> = Arc::new(kube_store);
    let rec = Arc::new(Reconciler::new(store.clone(), repo.clone(), events, Arc::new(JsonPath::new()), cfg.clone()));

    let (tx, rx) = mpsc::channel(cfg.queue_cap);
    let (catalog_tx, catalog_rx) = mpsc::channel(cfg.queue_cap);
    supervise(owner_ty.to_string(), spawn_watch(resources.clone(), owner_ty.clone(), namespace.clone(), None, tx.clone(), owner_trigger()));
    supervise(blueprint_ty.to_string(), spawn_watch(resources.clone(), blueprint_ty, None, None, catalog_tx.clone(), resync_trigger()));
    let mut watchers = Watchers {
        resources,
        namespace: namespace.clone(),
        owner_ty: owner_ty.clone(),
        template_gv: template_gv.to_string(),
        controller_tx: tx,
        catalog_tx,
        watched: Watched::default(),
    };
    watchers.refresh(repo.as_ref()).await?;
    tokio::spawn(follow_catalog(watchers, repo, catalog_rx));

    let controller = Controller::new(rec, store, owner_ty, namespace);
    controller
        .run(rx, async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
        })
        .await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = Config::from_env();

    match cli.command {
        Commands::Match { owner, files } => cmd_match(cli.output, &owner, &files, &cfg),
        Commands::Render { owner, template, params, configs, resource } => {
            cmd_render(cli.output, &owner, &template, &params, &configs, &resource)
        }
        Commands::Simulate { owner, files, cycles, mark_healthy } => {
            if cycles == 0 {
                bail!("--cycles must be at least 1");
            }
            cmd_simulate(cli.output, &owner, &files, cycles, mark_healthy, cfg).await
        }
        Commands::Run { owner_gvk, blueprint_gvk, template_group_version } => {
            info!(owner = %owner_gvk, blueprint = %blueprint_gvk, ns = ?cli.namespace, "run invoked");
            cmd_run(cli.namespace, &owner_gvk, &blueprint_gvk, &template_group_version, cfg).await
        }
    }
}
