//! Check-config command - validate a configuration file.

use crate::cli::args::CheckConfigArgs;
use crate::core::Config;
use anyhow::Result;
use serde_json::json;

pub fn run_check_config(args: CheckConfigArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    config.validate()?;
    let queues: Vec<&str> = config.queues.iter().map(|q| q.name.as_str()).collect();
    let summary = json!({
        "config": args.config.display().to_string(),
        "tag_prefix": config.session.tag_prefix,
        "default_flow_mode": config.session.default_flow_mode.flow_mode().as_str(),
        "prefetch_count": config.session.prefetch_count,
        "prefetch_size": config.session.prefetch_size,
        "max_delivery_records": config.session.max_delivery_records,
        "queues": queues,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
