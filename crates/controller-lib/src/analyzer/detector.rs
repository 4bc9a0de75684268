//! Pattern detection over folder snapshots
//!
//! Pure and deterministic: the same snapshot always yields the same
//! signals. Signal sets are ordered so downstream output is stable.

use super::snapshot::{file_name, is_under, FolderSnapshot};
use crate::models::ServiceType;
use std::collections::{BTreeMap, BTreeSet};

/// Manifest file names and the language/service type they imply.
/// Order is priority: the first manifest found decides the service type.
const MANIFEST_RULES: &[(&str, &str, ServiceType)] = &[
    ("package.json", "javascript", ServiceType::Nodejs),
    ("requirements.txt", "python", ServiceType::Python),
    ("pyproject.toml", "python", ServiceType::Python),
    ("Pipfile", "python", ServiceType::Python),
    ("go.mod", "go", ServiceType::Go),
    ("Cargo.toml", "rust", ServiceType::Rust),
    ("Gemfile", "ruby", ServiceType::Ruby),
    ("composer.json", "php", ServiceType::Php),
    ("pom.xml", "java", ServiceType::Java),
    ("build.gradle", "java", ServiceType::Java),
    ("build.gradle.kts", "java", ServiceType::Java),
    ("mix.exs", "elixir", ServiceType::Elixir),
];

pub const DOCKERFILE: &str = "Dockerfile";

/// A dependency marker that identifies a framework
struct FrameworkMarker {
    service_type: ServiceType,
    needle: &'static str,
    framework: &'static str,
    http: bool,
    heavy: bool,
}

const fn fw(
    service_type: ServiceType,
    needle: &'static str,
    framework: &'static str,
    http: bool,
    heavy: bool,
) -> FrameworkMarker {
    FrameworkMarker {
        service_type,
        needle,
        framework,
        http,
        heavy,
    }
}

const FRAMEWORK_MARKERS: &[FrameworkMarker] = &[
    fw(ServiceType::Nodejs, "express", "express", true, false),
    fw(ServiceType::Nodejs, "fastify", "fastify", true, false),
    fw(ServiceType::Nodejs, "koa", "koa", true, false),
    fw(ServiceType::Nodejs, "next", "nextjs", true, true),
    fw(ServiceType::Nodejs, "nuxt", "nuxt", true, true),
    fw(ServiceType::Nodejs, "@nestjs/core", "nestjs", true, true),
    fw(ServiceType::Nodejs, "@angular/core", "angular", true, true),
    fw(ServiceType::Nodejs, "react", "react", true, false),
    fw(ServiceType::Nodejs, "vue", "vue", true, false),
    fw(ServiceType::Nodejs, "svelte", "svelte", true, false),
    fw(ServiceType::Nodejs, "bullmq", "bullmq", false, false),
    fw(ServiceType::Python, "django", "django", true, true),
    fw(ServiceType::Python, "flask", "flask", true, false),
    fw(ServiceType::Python, "fastapi", "fastapi", true, false),
    fw(ServiceType::Python, "streamlit", "streamlit", true, false),
    fw(ServiceType::Python, "celery", "celery", false, false),
    fw(ServiceType::Go, "github.com/gin-gonic/gin", "gin", true, false),
    fw(ServiceType::Go, "github.com/labstack/echo", "echo", true, false),
    fw(ServiceType::Go, "github.com/gofiber/fiber", "fiber", true, false),
    fw(ServiceType::Go, "github.com/gorilla/mux", "gorilla", true, false),
    fw(ServiceType::Rust, "axum", "axum", true, false),
    fw(ServiceType::Rust, "actix-web", "actix", true, false),
    fw(ServiceType::Rust, "rocket", "rocket", true, false),
    fw(ServiceType::Rust, "warp", "warp", true, false),
    fw(ServiceType::Ruby, "rails", "rails", true, true),
    fw(ServiceType::Ruby, "sinatra", "sinatra", true, false),
    fw(ServiceType::Ruby, "sidekiq", "sidekiq", false, false),
    fw(ServiceType::Php, "laravel/framework", "laravel", true, true),
    fw(ServiceType::Php, "symfony/framework-bundle", "symfony", true, true),
    fw(ServiceType::Java, "spring-boot", "spring", true, true),
    fw(ServiceType::Java, "quarkus", "quarkus", true, true),
    fw(ServiceType::Elixir, "phoenix", "phoenix", true, true),
];

/// Needles that reveal a database dependency in any captured file
const DATABASE_MARKERS: &[(&str, &str)] = &[
    ("pg", "postgres"),
    ("postgres", "postgres"),
    ("postgresql", "postgres"),
    ("psycopg2", "postgres"),
    ("psycopg2-binary", "postgres"),
    ("psycopg", "postgres"),
    ("asyncpg", "postgres"),
    ("github.com/lib/pq", "postgres"),
    ("github.com/jackc/pgx", "postgres"),
    ("tokio-postgres", "postgres"),
    ("postgrex", "postgres"),
    ("mysql", "mysql"),
    ("mysql2", "mysql"),
    ("pymysql", "mysql"),
    ("mysqlclient", "mysql"),
    ("mariadb", "mysql"),
    ("github.com/go-sql-driver/mysql", "mysql"),
    ("mongodb", "mongodb"),
    ("mongoose", "mongodb"),
    ("pymongo", "mongodb"),
    ("mongoid", "mongodb"),
    ("mongo", "mongodb"),
    ("go.mongodb.org/mongo-driver", "mongodb"),
    ("redis", "redis"),
    ("ioredis", "redis"),
    ("redix", "redis"),
    ("github.com/redis/go-redis", "redis"),
    ("sqlite3", "sqlite"),
    ("better-sqlite3", "sqlite"),
    ("rusqlite", "sqlite"),
];

const EXTENSION_LANGUAGES: &[(&str, &str)] = &[
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("mjs", "javascript"),
    ("cjs", "javascript"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("py", "python"),
    ("go", "go"),
    ("rs", "rust"),
    ("rb", "ruby"),
    ("php", "php"),
    ("java", "java"),
    ("kt", "java"),
    ("ex", "elixir"),
    ("exs", "elixir"),
    ("html", "html"),
    ("htm", "html"),
    ("css", "html"),
];

/// Languages whose files make up at least this share count as present
const LANGUAGE_RATIO_THRESHOLD: f32 = 0.1;

/// Whether a file name is a recognized manifest (Dockerfile included)
pub fn is_manifest(name: &str) -> bool {
    name == DOCKERFILE || MANIFEST_RULES.iter().any(|(file, _, _)| *file == name)
}

/// Language implied by a file extension, if recognized
pub fn language_for_extension(path: &str) -> Option<&'static str> {
    let name = file_name(path);
    let ext = name.rsplit_once('.').map(|(_, ext)| ext)?;
    EXTENSION_LANGUAGES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, lang)| *lang)
}

/// Raw signals detected for one directory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternSignals {
    pub languages: BTreeSet<String>,
    pub frameworks: BTreeSet<String>,
    pub databases: BTreeSet<String>,
    /// Relative paths of manifests found (Dockerfile included)
    pub manifests_found: Vec<String>,
    pub entry_points: Vec<String>,
    pub service_type: ServiceType,
    /// Share of recognized source files written in the dominant language
    pub dominant_ratio: f32,
    pub has_http_framework: bool,
    pub has_heavy_framework: bool,
    pub dockerfile: Option<String>,
}

impl PatternSignals {
    /// Whether a language manifest (not just a Dockerfile) was found
    pub fn has_language_manifest(&self) -> bool {
        self.manifests_found
            .iter()
            .any(|m| file_name(m) != DOCKERFILE)
    }

    pub fn has_dockerfile(&self) -> bool {
        self.dockerfile.is_some()
    }
}

/// Stateless scanner that turns a snapshot directory into signals
#[derive(Debug, Clone, Default)]
pub struct PatternDetector;

impl PatternDetector {
    pub fn new() -> Self {
        Self
    }

    /// Detect signals for `dir`, ignoring files under any of `excluded`
    pub fn detect(&self, snapshot: &FolderSnapshot, dir: &str, excluded: &[String]) -> PatternSignals {
        let owned = |path: &str| {
            is_under(path, dir) && !excluded.iter().any(|ex| is_under(path, ex))
        };

        let mut signals = PatternSignals::default();
        let mut manifest_texts: Vec<(&str, &str)> = Vec::new();
        let mut all_texts: Vec<&str> = Vec::new();

        // Manifests sit directly in `dir`
        for path in snapshot.files().iter().filter(|p| owned(p.as_str())) {
            let name = file_name(path);
            let direct = super::snapshot::parent_dir(path) == dir;
            if direct && is_manifest(name) {
                signals.manifests_found.push(path.clone());
                if let Some(content) = snapshot.content(path) {
                    if name == DOCKERFILE {
                        signals.dockerfile = Some(content.to_string());
                    } else {
                        manifest_texts.push((name, content));
                    }
                }
            }
        }

        // package.json is only ever matched on its dependency keys
        for (path, content) in snapshot.captured_under(dir) {
            if owned(path) && file_name(path) != "package.json" {
                all_texts.push(content);
            }
        }

        // Service type from the highest-priority manifest present
        signals.service_type = MANIFEST_RULES
            .iter()
            .find(|(file, _, _)| {
                signals
                    .manifests_found
                    .iter()
                    .any(|m| file_name(m) == *file)
            })
            .map(|(_, _, ty)| *ty)
            .unwrap_or(if signals.has_dockerfile() {
                ServiceType::Docker
            } else {
                ServiceType::Unknown
            });

        for (file, language, _) in MANIFEST_RULES {
            if signals.manifests_found.iter().any(|m| file_name(m) == *file) {
                signals.languages.insert(language.to_string());
            }
        }

        // Extension ratios
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for path in snapshot.files().iter().filter(|p| owned(p.as_str())) {
            if let Some(lang) = language_for_extension(path) {
                *counts.entry(lang).or_default() += 1;
            }
        }
        let total: usize = counts.values().sum();
        if total > 0 {
            for (lang, count) in &counts {
                if *count as f32 / total as f32 >= LANGUAGE_RATIO_THRESHOLD {
                    signals.languages.insert(lang.to_string());
                }
            }
            // Ties resolve to the alphabetically first language
            let (dominant, count) = counts
                .iter()
                .fold(("", 0usize), |best, (lang, count)| {
                    if *count > best.1 {
                        (*lang, *count)
                    } else {
                        best
                    }
                });
            signals.dominant_ratio = count as f32 / total as f32;

            if signals.service_type == ServiceType::Unknown {
                signals.service_type = service_type_for_language(dominant);
            }
        }

        if signals.service_type == ServiceType::Nodejs
            && (counts.contains_key("typescript")
                || snapshot
                    .files()
                    .iter()
                    .any(|p| owned(p.as_str()) && file_name(p) == "tsconfig.json"))
        {
            signals.languages.insert("typescript".to_string());
        }

        // Frameworks from manifests of the matching ecosystem
        for marker in FRAMEWORK_MARKERS {
            let found = manifest_texts.iter().any(|(name, content)| {
                manifest_service_type(name) == Some(marker.service_type)
                    && manifest_mentions(name, content, marker.needle)
            });
            if found {
                signals.frameworks.insert(marker.framework.to_string());
                signals.has_http_framework |= marker.http;
                signals.has_heavy_framework |= marker.heavy;
            }
        }

        // Databases from any captured text
        for (needle, database) in DATABASE_MARKERS {
            let found = manifest_texts
                .iter()
                .any(|(name, content)| manifest_mentions(name, content, needle))
                || all_texts.iter().any(|content| mentions(content, needle));
            if found {
                signals.databases.insert(database.to_string());
            }
        }

        signals.entry_points = detect_entry_points(snapshot, dir, &owned, signals.service_type, &manifest_texts);
        signals
    }
}

fn service_type_for_language(language: &str) -> ServiceType {
    match language {
        "javascript" | "typescript" => ServiceType::Nodejs,
        "python" => ServiceType::Python,
        "go" => ServiceType::Go,
        "rust" => ServiceType::Rust,
        "ruby" => ServiceType::Ruby,
        "php" => ServiceType::Php,
        "java" => ServiceType::Java,
        "elixir" => ServiceType::Elixir,
        "html" => ServiceType::Static,
        _ => ServiceType::Unknown,
    }
}

fn manifest_service_type(name: &str) -> Option<ServiceType> {
    MANIFEST_RULES
        .iter()
        .find(|(file, _, _)| *file == name)
        .map(|(_, _, ty)| *ty)
}

/// package.json is matched on dependency keys; other manifests on tokens
fn manifest_mentions(name: &str, content: &str, needle: &str) -> bool {
    if name == "package.json" {
        return package_dependencies(content).contains(needle);
    }
    mentions(content, needle)
}

fn package_dependencies(content: &str) -> BTreeSet<String> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(content) else {
        return BTreeSet::new();
    };
    ["dependencies", "devDependencies"]
        .iter()
        .filter_map(|key| value.get(key).and_then(|d| d.as_object()))
        .flat_map(|deps| deps.keys().cloned())
        .collect()
}

/// Case-insensitive match of `needle` delimited by non-identifier characters
pub(crate) fn mentions(content: &str, needle: &str) -> bool {
    let haystack = content.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '-';

    let mut start = 0;
    while let Some(pos) = haystack[start..].find(&needle) {
        let begin = start + pos;
        let end = begin + needle.len();
        let before_ok = haystack[..begin].chars().next_back().map_or(true, |c| !is_ident(c));
        let after_ok = haystack[end..].chars().next().map_or(true, |c| !is_ident(c));
        if before_ok && after_ok {
            return true;
        }
        start = begin + 1;
        while !haystack.is_char_boundary(start) {
            start += 1;
        }
    }
    false
}

fn detect_entry_points(
    snapshot: &FolderSnapshot,
    dir: &str,
    owned: &dyn Fn(&str) -> bool,
    service_type: ServiceType,
    manifest_texts: &[(&str, &str)],
) -> Vec<String> {
    let mut entries = Vec::new();

    if service_type == ServiceType::Nodejs {
        if let Some((_, content)) = manifest_texts.iter().find(|(n, _)| *n == "package.json") {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(content) {
                if let Some(main) = value.get("main").and_then(|m| m.as_str()) {
                    entries.push(main.to_string());
                }
                if let Some(start) = value.pointer("/scripts/start").and_then(|s| s.as_str()) {
                    entries.push(format!("npm start ({})", start));
                }
            }
        }
    }

    let candidates: &[&str] = match service_type {
        ServiceType::Nodejs => &["index.js", "server.js", "app.js", "src/index.js", "src/index.ts", "src/main.ts"],
        ServiceType::Python => &["main.py", "app.py", "manage.py", "wsgi.py", "src/main.py", "app/main.py"],
        ServiceType::Go => &["main.go"],
        ServiceType::Rust => &["src/main.rs"],
        ServiceType::Ruby => &["config.ru", "app.rb"],
        ServiceType::Php => &["public/index.php", "index.php", "artisan"],
        ServiceType::Static => &["index.html", "public/index.html"],
        _ => &[],
    };

    for candidate in candidates {
        let path = if dir == "." {
            candidate.to_string()
        } else {
            format!("{}/{}", dir, candidate)
        };
        let exists = owned(&path) && snapshot.files().binary_search(&path).is_ok();
        if exists && !entries.iter().any(|e| e == candidate) {
            entries.push(candidate.to_string());
        }
    }

    if service_type == ServiceType::Go && entries.is_empty() {
        let prefix = if dir == "." { "cmd/".to_string() } else { format!("{}/cmd/", dir) };
        if let Some(cmd_main) = snapshot
            .files()
            .iter()
            .find(|p| owned(p.as_str()) && p.starts_with(&prefix) && p.ends_with("/main.go"))
        {
            let relative = if dir == "." {
                cmd_main.clone()
            } else {
                cmd_main[dir.len() + 1..].to_string()
            };
            entries.push(relative);
        }
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(files: &[(&str, Option<&str>)]) -> FolderSnapshot {
        FolderSnapshot::from_files(
            "/workspace/app",
            files.iter().map(|(p, c)| (p.to_string(), c.map(str::to_string))),
        )
    }

    #[test]
    fn test_detects_node_express_with_postgres() {
        let snap = snapshot(&[
            (
                "package.json",
                Some(r#"{"main":"server.js","dependencies":{"express":"^4","pg":"^8"}}"#),
            ),
            ("server.js", None),
            ("routes/users.js", None),
        ]);

        let signals = PatternDetector::new().detect(&snap, ".", &[]);

        assert_eq!(signals.service_type, ServiceType::Nodejs);
        assert!(signals.languages.contains("javascript"));
        assert!(signals.frameworks.contains("express"));
        assert!(signals.databases.contains("postgres"));
        assert!(signals.has_http_framework);
        assert!(!signals.has_heavy_framework);
        assert_eq!(signals.entry_points[0], "server.js");
        assert_eq!(signals.manifests_found, vec!["package.json".to_string()]);
    }

    #[test]
    fn test_package_json_matches_dependency_keys_only() {
        // "next" appears in the description, not as a dependency
        let snap = snapshot(&[(
            "package.json",
            Some(r#"{"description":"the next big thing","dependencies":{"koa":"2"}}"#),
        )]);

        let signals = PatternDetector::new().detect(&snap, ".", &[]);

        assert!(signals.frameworks.contains("koa"));
        assert!(!signals.frameworks.contains("nextjs"));
    }

    #[test]
    fn test_detects_python_django_and_celery_worker() {
        let snap = snapshot(&[
            ("requirements.txt", Some("Django==5.0\ncelery==5.3\npsycopg2-binary==2.9\nredis==5\n")),
            ("manage.py", None),
        ]);

        let signals = PatternDetector::new().detect(&snap, ".", &[]);

        assert_eq!(signals.service_type, ServiceType::Python);
        assert!(signals.frameworks.contains("django"));
        assert!(signals.frameworks.contains("celery"));
        assert!(signals.has_heavy_framework);
        assert!(signals.databases.contains("redis"));
        assert_eq!(signals.entry_points, vec!["manage.py".to_string()]);
    }

    #[test]
    fn test_excluded_subdirectories_are_ignored() {
        let snap = snapshot(&[
            ("go.mod", Some("module example.com/gw\nrequire github.com/gin-gonic/gin v1.9.1\n")),
            ("main.go", None),
            ("worker/Cargo.toml", Some("[dependencies]\nredis = \"0.24\"\n")),
            ("worker/src/main.rs", None),
        ]);

        let signals = PatternDetector::new().detect(&snap, ".", &["worker".to_string()]);

        assert_eq!(signals.service_type, ServiceType::Go);
        assert!(signals.frameworks.contains("gin"));
        assert!(!signals.languages.contains("rust"));
        assert!(!signals.databases.contains("redis"));
        assert_eq!(signals.dominant_ratio, 1.0);
    }

    #[test]
    fn test_dockerfile_only_folder() {
        let snap = snapshot(&[("Dockerfile", Some("FROM nginx\nEXPOSE 8081\n"))]);

        let signals = PatternDetector::new().detect(&snap, ".", &[]);

        assert_eq!(signals.service_type, ServiceType::Docker);
        assert!(signals.has_dockerfile());
        assert!(!signals.has_language_manifest());
    }

    #[test]
    fn test_detection_is_deterministic() {
        let snap = snapshot(&[
            ("Gemfile", Some("gem 'rails'\ngem 'pg'\n")),
            ("config.ru", None),
            ("app/models/user.rb", None),
        ]);
        let detector = PatternDetector::new();

        assert_eq!(detector.detect(&snap, ".", &[]), detector.detect(&snap, ".", &[]));
    }

    #[test]
    fn test_mentions_respects_boundaries() {
        assert!(mentions("flask==2.0", "flask"));
        assert!(mentions("DATABASE_URL=postgres://db", "postgres"));
        assert!(!mentions("djangorestframework", "django"));
        assert!(!mentions("actix-web-lab", "actix-web"));
        assert!(mentions("{:phoenix, \"~> 1.7\"}", "phoenix"));
    }
}
