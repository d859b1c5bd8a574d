use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "genforge",
    version,
    about = "genforge: local control plane for coexisting LLM and diffusion inference backends"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,

    /// Base directory for models, binaries and caches (defaults to the OS data dir)
    #[arg(long, global = true)]
    pub data_dir: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the diffusion server's HTTP listener
    Serve {
        #[arg(long, default_value = "auto")]
        bind: String,
        /// Path to a JSON/TOML diffusion config file (§6.2 keys)
        #[arg(long)]
        config: Option<String>,
        /// Base URL of an externally-managed LLM server control surface
        #[arg(long)]
        llm_control_url: Option<String>,
    },
    /// Model Manager operations
    Models {
        #[command(subcommand)]
        cmd: ModelsCommand,
    },
    /// Show the capability oracle's current host snapshot
    GpuInfo,
    /// Binary Manager operations
    Binary {
        #[command(subcommand)]
        cmd: BinaryCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ModelsCommand {
    /// List models with persisted metadata
    List {
        #[arg(short, long)]
        short: bool,
    },
    /// Download a model (single-file or multi-component)
    Pull {
        id: String,
        #[arg(long)]
        repo: String,
        #[arg(long)]
        file: String,
        #[arg(long, value_enum)]
        kind: ModelKindArg,
        #[arg(long)]
        display_name: Option<String>,
    },
    /// Remove a model's metadata and component files
    Remove { id: String },
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum ModelKindArg {
    Llm,
    Diffusion,
}

#[derive(Subcommand, Debug)]
pub enum BinaryCommand {
    /// Show cached validation status for a backend
    Status {
        #[arg(value_enum)]
        backend: BackendArg,
    },
    /// Resolve (downloading if needed) the backend binary
    Install {
        #[arg(value_enum)]
        backend: BackendArg,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum BackendArg {
    Llm,
    Diffusion,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn serve_command_default_bind() {
        let cli = Cli::try_parse_from(["genforge", "serve"]).unwrap();
        match cli.cmd {
            Command::Serve { bind, .. } => assert_eq!(bind, "auto"),
            _ => panic!("expected Serve command"),
        }
    }

    #[test]
    fn serve_command_manual_bind_and_llm_url() {
        let cli = Cli::try_parse_from([
            "genforge",
            "serve",
            "--bind",
            "127.0.0.1:8080",
            "--llm-control-url",
            "http://127.0.0.1:9001",
        ])
        .unwrap();
        match cli.cmd {
            Command::Serve {
                bind,
                llm_control_url,
                ..
            } => {
                assert_eq!(bind, "127.0.0.1:8080");
                assert_eq!(llm_control_url.as_deref(), Some("http://127.0.0.1:9001"));
            }
            _ => panic!("expected Serve command"),
        }
    }

    #[test]
    fn models_list_command() {
        let cli = Cli::try_parse_from(["genforge", "models", "list"]).unwrap();
        match cli.cmd {
            Command::Models {
                cmd: ModelsCommand::List { short },
            } => assert!(!short),
            _ => panic!("expected Models List command"),
        }
    }

    #[test]
    fn models_pull_command() {
        let cli = Cli::try_parse_from([
            "genforge",
            "models",
            "pull",
            "flux2-klein",
            "--repo",
            "black-forest-labs/FLUX.2-klein",
            "--file",
            "flux2-klein-4B-Q4_0.gguf",
            "--kind",
            "diffusion",
        ])
        .unwrap();
        match cli.cmd {
            Command::Models {
                cmd: ModelsCommand::Pull { id, repo, file, .. },
            } => {
                assert_eq!(id, "flux2-klein");
                assert_eq!(repo, "black-forest-labs/FLUX.2-klein");
                assert_eq!(file, "flux2-klein-4B-Q4_0.gguf");
            }
            _ => panic!("expected Models Pull command"),
        }
    }

    #[test]
    fn models_remove_command() {
        let cli = Cli::try_parse_from(["genforge", "models", "remove", "old-model"]).unwrap();
        match cli.cmd {
            Command::Models {
                cmd: ModelsCommand::Remove { id },
            } => assert_eq!(id, "old-model"),
            _ => panic!("expected Models Remove command"),
        }
    }

    #[test]
    fn gpu_info_command() {
        let cli = Cli::try_parse_from(["genforge", "gpu-info"]).unwrap();
        matches!(cli.cmd, Command::GpuInfo);
    }

    #[test]
    fn binary_status_command() {
        let cli = Cli::try_parse_from(["genforge", "binary", "status", "diffusion"]).unwrap();
        match cli.cmd {
            Command::Binary {
                cmd: BinaryCommand::Status { backend },
            } => assert!(matches!(backend, BackendArg::Diffusion)),
            _ => panic!("expected Binary Status command"),
        }
    }

    #[test]
    fn binary_install_command() {
        let cli = Cli::try_parse_from(["genforge", "binary", "install", "llm"]).unwrap();
        match cli.cmd {
            Command::Binary {
                cmd: BinaryCommand::Install { backend },
            } => assert!(matches!(backend, BackendArg::Llm)),
            _ => panic!("expected Binary Install command"),
        }
    }
}
