//! Folder analysis command

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{AnalyzeRequest, Analysis, ApiClient};
use crate::output::{color_confidence, format_timestamp, print_json, print_rows, OutputFormat};

/// Row for recommendations table
#[derive(Tabled)]
struct RecommendationRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Folder")]
    folder: String,
    #[tabled(rename = "Type")]
    service_type: String,
    #[tabled(rename = "Frameworks")]
    frameworks: String,
    #[tabled(rename = "Ports")]
    ports: String,
    #[tabled(rename = "Confidence")]
    confidence: String,
}

/// Analyze a workspace folder and show service recommendations
pub async fn analyze(client: &ApiClient, workspace: &str, folder: &str, format: OutputFormat) -> Result<()> {
    let path = format!("workspaces/{}/analyze", workspace);
    let analysis: Analysis = client
        .post(&path, &AnalyzeRequest { folder_path: folder })
        .await?;

    match format {
        OutputFormat::Json => print_json(&analysis)?,
        OutputFormat::Table => print_analysis(&analysis),
    }
    Ok(())
}

fn print_analysis(analysis: &Analysis) {
    println!("{}", "Folder Analysis".bold());
    println!("{}", "=".repeat(60));
    println!("Folder:     {}/{}", analysis.workspace_id, analysis.folder_path.cyan());
    println!("Analysis:   {}", analysis.id);
    println!("Analyzed:   {}", format_timestamp(Some(&analysis.created_at)));
    println!("Strategy:   {}", analysis.deployment_strategy.replace('_', " "));
    println!("Languages:  {}", join_or_dash(&analysis.patterns.languages));
    if !analysis.patterns.databases.is_empty() {
        println!("Databases:  {}", analysis.patterns.databases.join(", "));
    }
    println!();

    let rows = analysis
        .recommendations
        .iter()
        .map(|r| RecommendationRow {
            name: r.name.clone(),
            folder: r.folder_path.clone(),
            service_type: r.service_type.clone(),
            frameworks: join_or_dash(&r.frameworks),
            ports: r
                .ports
                .iter()
                .map(|p| format!("{}:{}", p.host_port, p.container_port))
                .collect::<Vec<_>>()
                .join(", "),
            confidence: color_confidence(r.confidence),
        })
        .collect();
    print_rows(rows, "No deployable services found");
}

fn join_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}
