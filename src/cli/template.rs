use anyhow::{Context, Result};

const SERVER_TEMPLATE: &str = include_str!("../../templates/server.toml");
const AGENT_TEMPLATE: &str = include_str!("../../templates/agent.toml");

/// Generate configuration template
pub fn generate_config_template(template_type: &str, output: Option<&str>) -> Result<()> {
    let content = match template_type {
        "server" => SERVER_TEMPLATE,
        "agent" => AGENT_TEMPLATE,
        other => anyhow::bail!("Unknown template type: {}", other),
    };

    if let Some(path) = output {
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!(
            "Generated {} configuration template: {}",
            template_type, path
        );
    } else {
        println!("{}", content);
    }

    Ok(())
}
