//! Topology analysis: candidate services, confidence, graph and recommendations

use super::detector::{is_manifest, mentions, PatternDetector, PatternSignals};
use super::snapshot::{file_name, is_under, parent_dir, FolderSnapshot};
use super::templates;
use crate::error::{ControlError, Result};
use crate::models::{
    DeploymentStrategy, HealthCheckConfig, PatternSummary, PortMapping, Protocol, RelationKind,
    ResourceLimits, ServiceEdge, ServiceGraph, ServiceNode, ServiceRecommendation, ServiceType,
    TopologyAnalysis,
};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// First host port handed out to recommendations of one analysis
const BASE_HOST_PORT: u16 = 8080;

/// Analyses kept per folder; older ones are dropped from the history
const MAX_HISTORY: usize = 50;

/// One self-contained directory and the signals detected for it
#[derive(Debug, Clone)]
struct Candidate {
    dir: String,
    name: String,
    signals: PatternSignals,
    confidence: f32,
    port: u16,
}

impl Candidate {
    fn has_manifest(&self) -> bool {
        !self.signals.manifests_found.is_empty()
    }
}

/// Turns folder snapshots into immutable `TopologyAnalysis` records
pub struct TopologyAnalyzer {
    detector: PatternDetector,
    workspace_root: Option<PathBuf>,
    history: DashMap<(String, String), Vec<Arc<TopologyAnalysis>>>,
}

impl TopologyAnalyzer {
    /// With a workspace root, folder paths resolve to `<root>/<workspace_id>/<folder_path>`
    pub fn new(workspace_root: Option<PathBuf>) -> Self {
        Self {
            detector: PatternDetector::new(),
            workspace_root,
            history: DashMap::new(),
        }
    }

    /// Absolute location of a workspace folder
    pub fn resolve_folder(&self, workspace_id: &str, folder_path: &str) -> Result<PathBuf> {
        let Some(root) = &self.workspace_root else {
            if folder_path.is_empty() {
                return Err(ControlError::Validation("folder_path must not be empty".into()));
            }
            return Ok(PathBuf::from(folder_path));
        };

        if workspace_id.is_empty() || !is_plain_relative(Path::new(workspace_id)) || workspace_id.contains('/') {
            return Err(ControlError::Validation(format!(
                "invalid workspace id '{}'",
                workspace_id
            )));
        }
        let relative = Path::new(folder_path);
        if !is_plain_relative(relative) {
            return Err(ControlError::Validation(format!(
                "folder_path '{}' must be relative to the workspace and must not contain '..'",
                folder_path
            )));
        }
        Ok(root.join(workspace_id).join(relative))
    }

    /// Scan the folder and record a new analysis for it
    pub async fn analyze(&self, workspace_id: &str, folder_path: &str) -> Result<Arc<TopologyAnalysis>> {
        let path = self.resolve_folder(workspace_id, folder_path)?;

        let snapshot = tokio::task::spawn_blocking(move || FolderSnapshot::scan(&path))
            .await
            .map_err(|e| ControlError::Internal(format!("scan task failed: {e}")))??;

        let analysis = Arc::new(self.analyze_snapshot(workspace_id, folder_path, &snapshot));
        self.record(Arc::clone(&analysis));

        info!(
            workspace_id = %workspace_id,
            folder_path = %folder_path,
            analysis_id = %analysis.id,
            candidates = analysis.recommendations.len(),
            strategy = ?analysis.deployment_strategy,
            "Topology analysis completed"
        );
        Ok(analysis)
    }

    /// Pure analysis of an already captured snapshot; does not record history
    pub fn analyze_snapshot(
        &self,
        workspace_id: &str,
        folder_path: &str,
        snapshot: &FolderSnapshot,
    ) -> TopologyAnalysis {
        let mut candidates = self.candidates(snapshot);

        candidates.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| b.has_manifest().cmp(&a.has_manifest()))
                .then_with(|| a.dir.cmp(&b.dir))
        });

        let excluded = self.nested_dirs(&candidates);
        let edges = infer_edges(snapshot, &candidates, &excluded);
        let patterns = self.summarize(snapshot, &candidates);

        let nodes = candidates
            .iter()
            .map(|c| ServiceNode {
                id: c.dir.clone(),
                name: c.name.clone(),
                service_type: c.signals.service_type,
                port: c.port,
                file_path: primary_file(c),
                confidence: c.confidence,
                has_manifest: c.has_manifest(),
            })
            .collect();

        let recommendations = candidates
            .iter()
            .enumerate()
            .map(|(index, c)| recommend(snapshot, folder_path, index, c))
            .collect();

        let deployment_strategy = match candidates.len() {
            0 => DeploymentStrategy::Undetermined,
            1 => DeploymentStrategy::SingleContainer,
            _ => DeploymentStrategy::MultiService,
        };

        TopologyAnalysis {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.to_string(),
            folder_path: folder_path.to_string(),
            created_at: Utc::now(),
            snapshot_digest: snapshot.digest(),
            patterns,
            graph: ServiceGraph { nodes, edges },
            recommendations,
            deployment_strategy,
        }
    }

    /// Most recent analysis of a folder
    pub fn latest(&self, workspace_id: &str, folder_path: &str) -> Option<Arc<TopologyAnalysis>> {
        self.history
            .get(&history_key(workspace_id, folder_path))
            .and_then(|h| h.last().cloned())
    }

    /// Analyses of a folder, oldest first
    pub fn history(&self, workspace_id: &str, folder_path: &str) -> Vec<Arc<TopologyAnalysis>> {
        self.history
            .get(&history_key(workspace_id, folder_path))
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    fn record(&self, analysis: Arc<TopologyAnalysis>) {
        let key = history_key(&analysis.workspace_id, &analysis.folder_path);
        let mut entry = self.history.entry(key).or_default();
        entry.push(analysis);
        if entry.len() > MAX_HISTORY {
            let overflow = entry.len() - MAX_HISTORY;
            entry.drain(..overflow);
        }
    }

    fn candidates(&self, snapshot: &FolderSnapshot) -> Vec<Candidate> {
        let mut dirs: BTreeSet<String> = snapshot
            .files()
            .iter()
            .filter(|p| is_manifest(file_name(p)))
            .map(|p| parent_dir(p).to_string())
            .collect();

        let heuristic = dirs.is_empty();
        if heuristic {
            dirs.insert(".".to_string());
        }

        let dirs: Vec<String> = dirs.into_iter().collect();
        let mut used_names = BTreeSet::new();
        let mut candidates = Vec::new();

        for dir in &dirs {
            let excluded: Vec<String> = dirs
                .iter()
                .filter(|other| *other != dir && is_under(other, dir))
                .cloned()
                .collect();
            let signals = self.detector.detect(snapshot, dir, &excluded);

            // Without a manifest, only recognizable source files make a service
            if heuristic && signals.dominant_ratio == 0.0 {
                continue;
            }

            let raw_name = if dir == "." {
                snapshot.root_name()
            } else {
                file_name(dir).to_string()
            };
            let name = unique_name(&service_name(&raw_name), &mut used_names);

            debug!(dir = %dir, service_type = %signals.service_type, "Candidate service found");
            candidates.push(Candidate {
                port: default_port(&signals),
                confidence: confidence(&signals),
                dir: dir.clone(),
                name,
                signals,
            });
        }
        candidates
    }

    fn nested_dirs(&self, candidates: &[Candidate]) -> BTreeMap<String, Vec<String>> {
        candidates
            .iter()
            .map(|c| {
                let nested = candidates
                    .iter()
                    .filter(|o| o.dir != c.dir && is_under(&o.dir, &c.dir))
                    .map(|o| o.dir.clone())
                    .collect();
                (c.dir.clone(), nested)
            })
            .collect()
    }

    fn summarize(&self, snapshot: &FolderSnapshot, candidates: &[Candidate]) -> PatternSummary {
        let whole = self.detector.detect(snapshot, ".", &[]);
        let mut languages = whole.languages;
        let mut frameworks = BTreeSet::new();
        let mut databases = whole.databases;
        for c in candidates {
            languages.extend(c.signals.languages.iter().cloned());
            frameworks.extend(c.signals.frameworks.iter().cloned());
            databases.extend(c.signals.databases.iter().cloned());
        }
        PatternSummary {
            languages: languages.into_iter().collect(),
            frameworks: frameworks.into_iter().collect(),
            databases: databases.into_iter().collect(),
        }
    }
}

/// Confidence from signal strength; every term is non-negative
pub(crate) fn confidence(signals: &PatternSignals) -> f32 {
    let mut score = 0.0f32;
    if signals.has_language_manifest() {
        score += 0.45;
    }
    if signals.has_dockerfile() {
        score += 0.15;
    }
    let extra_manifests = signals.manifests_found.len().saturating_sub(1) as f32;
    score += (extra_manifests * 0.05).min(0.1);
    if !signals.frameworks.is_empty() {
        score += 0.15;
    }
    if !signals.entry_points.is_empty() {
        score += 0.1;
    }
    score += 0.15 * signals.dominant_ratio;

    (score.min(1.0) * 100.0).round() / 100.0
}

fn default_port(signals: &PatternSignals) -> u16 {
    let has = |fw: &str| signals.frameworks.contains(fw);
    match signals.service_type {
        ServiceType::Nodejs => 3000,
        ServiceType::Python if has("streamlit") => 8501,
        ServiceType::Python if has("flask") && !has("django") && !has("fastapi") => 5000,
        ServiceType::Python => 8000,
        ServiceType::Rust if has("rocket") => 8000,
        ServiceType::Go | ServiceType::Rust | ServiceType::Java => 8080,
        ServiceType::Ruby if has("sinatra") && !has("rails") => 4567,
        ServiceType::Ruby => 3000,
        ServiceType::Php if has("laravel") => 8000,
        ServiceType::Php | ServiceType::Static => 80,
        ServiceType::Elixir => 4000,
        ServiceType::Docker | ServiceType::Unknown => signals
            .dockerfile
            .as_deref()
            .and_then(templates::exposed_port)
            .unwrap_or(8080),
    }
}

fn default_env(signals: &PatternSignals, port: u16) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PORT".to_string(), port.to_string());
    let pairs: &[(&str, &str)] = match signals.service_type {
        ServiceType::Nodejs => &[("NODE_ENV", "production")],
        ServiceType::Python => &[("PYTHONUNBUFFERED", "1")],
        ServiceType::Rust => &[("RUST_LOG", "info")],
        ServiceType::Go if signals.frameworks.contains("gin") => &[("GIN_MODE", "release")],
        ServiceType::Ruby if signals.frameworks.contains("rails") => &[("RAILS_ENV", "production")],
        ServiceType::Ruby => &[("RACK_ENV", "production")],
        ServiceType::Elixir if signals.frameworks.contains("phoenix") => {
            &[("MIX_ENV", "prod"), ("PHX_SERVER", "true")]
        }
        ServiceType::Elixir => &[("MIX_ENV", "prod")],
        _ => &[],
    };
    for (key, value) in pairs {
        env.insert(key.to_string(), value.to_string());
    }
    env
}

fn default_resources(signals: &PatternSignals) -> ResourceLimits {
    if signals.has_heavy_framework || signals.service_type == ServiceType::Java {
        ResourceLimits {
            memory_mb: 1024,
            cpu_cores: 2.0,
        }
    } else {
        ResourceLimits::default()
    }
}

fn recommend(
    snapshot: &FolderSnapshot,
    folder_path: &str,
    index: usize,
    candidate: &Candidate,
) -> ServiceRecommendation {
    let signals = &candidate.signals;
    let binary_name = snapshot
        .content(&join(&candidate.dir, "Cargo.toml"))
        .and_then(templates::cargo_package_name)
        .unwrap_or_else(|| candidate.name.clone());

    let health_check = if signals.has_http_framework {
        HealthCheckConfig::default()
    } else {
        HealthCheckConfig::disabled()
    };

    ServiceRecommendation {
        node_id: candidate.dir.clone(),
        name: candidate.name.clone(),
        folder_path: if candidate.dir == "." {
            folder_path.to_string()
        } else {
            join(folder_path.trim_end_matches('/'), &candidate.dir)
        },
        service_type: signals.service_type,
        confidence: candidate.confidence,
        frameworks: signals.frameworks.iter().cloned().collect(),
        ports: vec![PortMapping {
            container_port: candidate.port,
            host_port: BASE_HOST_PORT.saturating_add(index as u16),
            protocol: Protocol::Tcp,
        }],
        env: default_env(signals, candidate.port),
        resources: default_resources(signals),
        health_check,
        build_file: templates::build_file(signals, candidate.port, &binary_name),
    }
}

/// `connects_to` edges come from config text naming another candidate;
/// `shares_database` edges from a common database signal
fn infer_edges(
    snapshot: &FolderSnapshot,
    candidates: &[Candidate],
    excluded: &BTreeMap<String, Vec<String>>,
) -> Vec<ServiceEdge> {
    let mut edges = BTreeSet::new();

    for from in candidates {
        let nested = excluded.get(&from.dir).map(Vec::as_slice).unwrap_or(&[]);
        let texts: Vec<&str> = snapshot
            .captured_under(&from.dir)
            .filter(|(path, _)| !is_manifest(file_name(path)))
            .filter(|(path, _)| !nested.iter().any(|n| is_under(path, n)))
            .map(|(_, content)| content)
            .collect();

        for to in candidates.iter().filter(|c| c.dir != from.dir) {
            let env_prefix = to.name.replace('-', "_");
            let referenced = texts.iter().any(|text| {
                mentions(text, &to.name)
                    || mentions(text, &format!("{env_prefix}_url"))
                    || mentions(text, &format!("{env_prefix}_host"))
            });
            if referenced {
                edges.insert((from.dir.clone(), to.dir.clone(), RelationKind::ConnectsTo));
            }
        }
    }

    let mut by_dir: Vec<&Candidate> = candidates.iter().collect();
    by_dir.sort_by(|a, b| a.dir.cmp(&b.dir));
    for (i, a) in by_dir.iter().enumerate() {
        for b in &by_dir[i + 1..] {
            if a.signals.databases.intersection(&b.signals.databases).next().is_some() {
                edges.insert((a.dir.clone(), b.dir.clone(), RelationKind::SharesDatabase));
            }
        }
    }

    edges
        .into_iter()
        .map(|(from, to, relation)| ServiceEdge { from, to, relation })
        .collect()
}

fn primary_file(candidate: &Candidate) -> String {
    candidate
        .signals
        .manifests_found
        .first()
        .cloned()
        .or_else(|| {
            candidate
                .signals
                .entry_points
                .first()
                .map(|e| join(&candidate.dir, e))
        })
        .unwrap_or_else(|| candidate.dir.clone())
}

fn join(dir: &str, file: &str) -> String {
    if dir == "." || dir.is_empty() {
        file.to_string()
    } else {
        format!("{}/{}", dir, file)
    }
}

/// Lowercase alphanumerics separated by single hyphens
fn service_name(raw: &str) -> String {
    let mut name = String::new();
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_lowercase());
        } else if !name.is_empty() && !name.ends_with('-') {
            name.push('-');
        }
    }
    let name = name.trim_end_matches('-');
    if name.is_empty() {
        "service".to_string()
    } else {
        name.to_string()
    }
}

fn unique_name(base: &str, used: &mut BTreeSet<String>) -> String {
    let mut name = base.to_string();
    let mut n = 2;
    while used.contains(&name) {
        name = format!("{}-{}", base, n);
        n += 1;
    }
    used.insert(name.clone());
    name
}

fn is_plain_relative(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn history_key(workspace_id: &str, folder_path: &str) -> (String, String) {
    let folder = folder_path.trim_end_matches('/');
    let folder = if folder.is_empty() { "." } else { folder };
    (workspace_id.to_string(), folder.to_string())
}
