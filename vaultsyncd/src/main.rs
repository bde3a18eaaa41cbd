use vaultsyncd::config::SyncConfig;
use vaultsyncd::sync::record::TriggerKind;
use vaultsyncd::sync::runner::SyncRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    DryRun,
    ShowPlan,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--dry" => mode = CliMode::DryRun,
            "--show-plan" => mode = CliMode::ShowPlan,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: vaultsyncd [--dry | --show-plan]");
            println!("  --dry        Build and store the plan without executing it");
            println!("  --show-plan  Print the most recently stored plan and exit");
            return Ok(());
        }
        mode => mode,
    };

    let config = SyncConfig::from_env()?;
    let runner = SyncRunner::new(config).await?;

    if mode == CliMode::ShowPlan {
        match runner.history().latest_sync_plan().await? {
            Some(plan) => println!("{plan}"),
            None => eprintln!("[vaultsyncd] no stored plan yet"),
        }
        return Ok(());
    }

    let trigger = if mode == CliMode::DryRun {
        TriggerKind::Dry
    } else {
        TriggerKind::Manual
    };
    let report = runner.run(trigger, SyncRunner::log_progress()).await?;
    eprintln!(
        "[vaultsyncd] done: {} record(s), {} deletion(s), executed: {}",
        report.records, report.deletions, report.executed
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(vec!["vaultsyncd".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_dry() {
        let mode = parse_cli_mode(vec!["vaultsyncd".to_string(), "--dry".to_string()]).unwrap();
        assert_eq!(mode, CliMode::DryRun);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(vec!["vaultsyncd".to_string(), "--nope".to_string()]).is_err());
    }
}
