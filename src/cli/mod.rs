pub mod commands;
pub mod config;
pub mod template;

pub use commands::execute_command;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tunnel-relay")]
#[command(author, version, about = "Expose services behind NAT through a single outbound tunnel", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，RUST_LOG 优先
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行服务器模式
    Server {
        /// 配置文件路径
        #[arg(short, long, default_value = "server.toml")]
        config: String,
    },
    /// 运行 agent 模式
    Agent {
        /// 配置文件路径
        #[arg(short, long, conflicts_with = "token")]
        config: Option<String>,

        /// 接入令牌（代替配置文件）
        #[arg(short, long)]
        token: Option<String>,
    },
    /// 生成 agent 接入令牌
    Token {
        /// 隧道 ID
        #[arg(long)]
        tunnel_id: String,

        /// 隧道密钥（16/24/32 字节）
        #[arg(long)]
        secret: String,

        /// 服务器地址（host:port）
        #[arg(long)]
        server: String,
    },
    /// 生成示例配置文件
    Template {
        /// 配置类型 (server, agent)
        #[arg(value_parser = ["server", "agent"])]
        template_type: String,

        /// 输出文件路径
        #[arg(short, long)]
        output: Option<String>,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式 (text, json)
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
}
