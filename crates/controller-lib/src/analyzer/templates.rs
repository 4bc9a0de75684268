//! Generated build files for detected services

use super::detector::PatternSignals;
use crate::models::ServiceType;

/// Build file for a candidate: an existing Dockerfile wins, otherwise one
/// is generated from the service type and detected framework
pub fn build_file(signals: &PatternSignals, port: u16, binary_name: &str) -> String {
    if let Some(existing) = &signals.dockerfile {
        return existing.clone();
    }

    let has = |fw: &str| signals.frameworks.contains(fw);
    let entry = signals
        .entry_points
        .iter()
        .find(|e| !e.starts_with("npm start"))
        .cloned();

    match signals.service_type {
        ServiceType::Nodejs => {
            let build_step = if ["nextjs", "nuxt", "nestjs", "angular", "react", "vue", "svelte"]
                .iter()
                .any(|fw| has(fw))
            {
                "RUN npm run build\n"
            } else {
                ""
            };
            format!(
                "FROM node:20-alpine\n\
                 WORKDIR /app\n\
                 COPY package*.json ./\n\
                 RUN npm ci --omit=dev || npm install --omit=dev\n\
                 COPY . .\n\
                 {build_step}\
                 ENV PORT={port}\n\
                 EXPOSE {port}\n\
                 CMD [\"npm\", \"start\"]\n"
            )
        }
        ServiceType::Python => {
            let cmd = if has("django") {
                format!("[\"python\", \"manage.py\", \"runserver\", \"0.0.0.0:{port}\"]")
            } else if has("fastapi") {
                let module = entry
                    .as_deref()
                    .map(|e| e.trim_end_matches(".py").replace('/', "."))
                    .unwrap_or_else(|| "main".to_string());
                format!("[\"uvicorn\", \"{module}:app\", \"--host\", \"0.0.0.0\", \"--port\", \"{port}\"]")
            } else if has("flask") {
                format!("[\"flask\", \"run\", \"--host\", \"0.0.0.0\", \"--port\", \"{port}\"]")
            } else if has("streamlit") {
                let script = entry.clone().unwrap_or_else(|| "app.py".to_string());
                format!("[\"streamlit\", \"run\", \"{script}\", \"--server.port\", \"{port}\"]")
            } else {
                let script = entry.clone().unwrap_or_else(|| "main.py".to_string());
                format!("[\"python\", \"{script}\"]")
            };
            format!(
                "FROM python:3.12-slim\n\
                 WORKDIR /app\n\
                 ENV PYTHONUNBUFFERED=1\n\
                 COPY . .\n\
                 RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; \
                 else pip install --no-cache-dir .; fi\n\
                 EXPOSE {port}\n\
                 CMD {cmd}\n"
            )
        }
        ServiceType::Go => {
            let package = entry
                .as_deref()
                .filter(|e| e.starts_with("cmd/"))
                .map(|e| format!("./{}", e.trim_end_matches("/main.go")))
                .unwrap_or_else(|| ".".to_string());
            format!(
                "FROM golang:1.22-alpine AS build\n\
                 WORKDIR /src\n\
                 COPY go.* ./\n\
                 RUN go mod download\n\
                 COPY . .\n\
                 RUN CGO_ENABLED=0 go build -o /out/server {package}\n\
                 \n\
                 FROM alpine:3.19\n\
                 COPY --from=build /out/server /usr/local/bin/server\n\
                 EXPOSE {port}\n\
                 CMD [\"server\"]\n"
            )
        }
        ServiceType::Rust => format!(
            "FROM rust:1-slim AS build\n\
             WORKDIR /src\n\
             COPY . .\n\
             RUN cargo build --release\n\
             \n\
             FROM debian:bookworm-slim\n\
             COPY --from=build /src/target/release/{binary_name} /usr/local/bin/{binary_name}\n\
             EXPOSE {port}\n\
             CMD [\"{binary_name}\"]\n"
        ),
        ServiceType::Ruby => {
            let cmd = if has("rails") {
                format!("[\"bin/rails\", \"server\", \"-b\", \"0.0.0.0\", \"-p\", \"{port}\"]")
            } else {
                format!("[\"bundle\", \"exec\", \"rackup\", \"--host\", \"0.0.0.0\", \"-p\", \"{port}\"]")
            };
            format!(
                "FROM ruby:3.3-slim\n\
                 WORKDIR /app\n\
                 COPY Gemfile* ./\n\
                 RUN bundle install\n\
                 COPY . .\n\
                 EXPOSE {port}\n\
                 CMD {cmd}\n"
            )
        }
        ServiceType::Php if has("laravel") => format!(
            "FROM php:8.3-cli\n\
             WORKDIR /app\n\
             COPY --from=composer:2 /usr/bin/composer /usr/bin/composer\n\
             COPY . .\n\
             RUN composer install --no-dev --optimize-autoloader\n\
             EXPOSE {port}\n\
             CMD [\"php\", \"artisan\", \"serve\", \"--host=0.0.0.0\", \"--port={port}\"]\n"
        ),
        ServiceType::Php => "FROM php:8.3-apache\n\
             COPY . /var/www/html/\n\
             EXPOSE 80\n"
            .to_string(),
        ServiceType::Java => format!(
            "FROM maven:3.9-eclipse-temurin-21 AS build\n\
             WORKDIR /src\n\
             COPY . .\n\
             RUN if [ -f pom.xml ]; then mvn -q package -DskipTests; else gradle build -x test; fi\n\
             \n\
             FROM eclipse-temurin:21-jre\n\
             COPY --from=build /src/target/*.jar /app/app.jar\n\
             EXPOSE {port}\n\
             CMD [\"java\", \"-jar\", \"/app/app.jar\"]\n"
        ),
        ServiceType::Elixir => format!(
            "FROM elixir:1.16\n\
             WORKDIR /app\n\
             ENV MIX_ENV=prod\n\
             COPY . .\n\
             RUN mix local.hex --force && mix local.rebar --force && mix deps.get --only prod && mix compile\n\
             EXPOSE {port}\n\
             CMD [\"mix\", \"{}\"]\n",
            if has("phoenix") { "phx.server" } else { "run --no-halt" }
        ),
        ServiceType::Static => "FROM nginx:alpine\n\
             COPY . /usr/share/nginx/html\n\
             EXPOSE 80\n"
            .to_string(),
        ServiceType::Docker | ServiceType::Unknown => format!(
            "FROM alpine:3.19\n\
             WORKDIR /app\n\
             COPY . .\n\
             EXPOSE {port}\n\
             CMD [\"sh\"]\n"
        ),
    }
}

/// `EXPOSE` port of an existing Dockerfile
pub fn exposed_port(dockerfile: &str) -> Option<u16> {
    dockerfile.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("EXPOSE")?;
        rest.split_whitespace()
            .next()
            .and_then(|p| p.split('/').next())
            .and_then(|p| p.parse().ok())
    })
}

/// Package name from a Cargo.toml `[package]` table
pub fn cargo_package_name(manifest: &str) -> Option<String> {
    let mut in_package = false;
    for line in manifest.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_package = line == "[package]";
            continue;
        }
        if in_package {
            if let Some(value) = line.strip_prefix("name") {
                let value = value.trim_start().strip_prefix('=')?.trim();
                return Some(value.trim_matches('"').to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(service_type: ServiceType, frameworks: &[&str]) -> PatternSignals {
        PatternSignals {
            service_type,
            frameworks: frameworks.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_existing_dockerfile_is_used_verbatim() {
        let mut s = signals(ServiceType::Nodejs, &["express"]);
        s.dockerfile = Some("FROM custom\n".to_string());

        assert_eq!(build_file(&s, 3000, "web"), "FROM custom\n");
    }

    #[test]
    fn test_node_next_build_includes_build_step() {
        let file = build_file(&signals(ServiceType::Nodejs, &["nextjs"]), 3000, "web");

        assert!(file.starts_with("FROM node:20-alpine"));
        assert!(file.contains("RUN npm run build"));
        assert!(file.contains("EXPOSE 3000"));
    }

    #[test]
    fn test_python_flask_command() {
        let file = build_file(&signals(ServiceType::Python, &["flask"]), 5000, "api");

        assert!(file.contains("\"flask\", \"run\""));
        assert!(file.contains("\"5000\""));
    }

    #[test]
    fn test_exposed_port_parsing() {
        assert_eq!(exposed_port("FROM nginx\nEXPOSE 8081/tcp\n"), Some(8081));
        assert_eq!(exposed_port("FROM nginx\n"), None);
    }

    #[test]
    fn test_cargo_package_name() {
        let manifest = "[package]\nname = \"billing-api\"\nversion = \"0.1.0\"\n\n[dependencies]\nname = \"x\"\n";
        assert_eq!(cargo_package_name(manifest).as_deref(), Some("billing-api"));
        assert_eq!(cargo_package_name("[workspace]\n"), None);
    }
}
