use apil_core::{ComponentHealth, SystemStatus};
use serde::Serialize;

use crate::OutputFormat;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub system_status: SystemStatus,
    pub components: Vec<ComponentHealth>,
}

pub fn print_status(report: &StatusReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
        }
        OutputFormat::Text => {
            println!("system status: {:?}", report.system_status);
            println!("{:<18} {:<10} {:>14} {:<25}", "component", "status", "error_rate_24h", "last_run_at");
            for health in &report.components {
                println!(
                    "{:<18} {:<10} {:>13.1}% {:<25}",
                    health.component.as_str(),
                    format!("{:?}", health.status),
                    health.error_rate_24h * 100.0,
                    health
                        .last_run_at
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string()),
                );
            }
        }
    }
}
