use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

use kubestream_types::{Scope, ScopeKind, SetType, WatchOptions, WatchRequest};

/// Kubestream - live multiplexed logs from Kubernetes pods
#[derive(Parser, Debug)]
#[command(name = "kubestream")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.config/kubestream/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the log channel server
    Serve(ServeArgs),
    /// Follow a scope from a server and print its lines
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Kubernetes context name
    #[arg(long, value_name = "NAME")]
    pub context: Option<String>,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// What to tail
    #[arg(long, value_enum)]
    pub scope: ScopeArg,

    #[arg(short, long, default_value = "")]
    pub namespace: String,

    /// Set or deployment name
    #[arg(long)]
    pub set: Option<String>,

    #[arg(long, value_enum)]
    pub set_type: Option<SetTypeArg>,

    #[arg(long)]
    pub pod: Option<String>,

    #[arg(short, long)]
    pub container: Option<String>,

    /// Ask the server for line timestamps
    #[arg(long)]
    pub timestamp: bool,

    /// Read the previous terminated container instance
    #[arg(long)]
    pub previous: bool,

    /// Lines kept in the session buffer
    #[arg(long)]
    pub max_messages: Option<usize>,

    /// Only print lines containing this text
    #[arg(long)]
    pub filter: Option<String>,

    /// Raise a timed alarm on lines containing this text (repeatable)
    #[arg(long = "alarm", value_name = "EXPR")]
    pub alarms: Vec<String>,

    /// Server url, e.g. ws://127.0.0.1:3883
    #[arg(long)]
    pub server: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ScopeArg {
    Container,
    Pod,
    Workload,
    Namespace,
    Cluster,
}

impl From<ScopeArg> for ScopeKind {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::Container => ScopeKind::Container,
            ScopeArg::Pod => ScopeKind::Pod,
            ScopeArg::Workload => ScopeKind::Workload,
            ScopeArg::Namespace => ScopeKind::Namespace,
            ScopeArg::Cluster => ScopeKind::Cluster,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SetTypeArg {
    Replica,
    Stateful,
    Daemon,
    Deployment,
}

impl From<SetTypeArg> for SetType {
    fn from(arg: SetTypeArg) -> Self {
        match arg {
            SetTypeArg::Replica => SetType::Replica,
            SetTypeArg::Stateful => SetType::Stateful,
            SetTypeArg::Daemon => SetType::Daemon,
            SetTypeArg::Deployment => SetType::Deployment,
        }
    }
}

impl WatchArgs {
    /// Validated scope, with the same rules the server applies
    pub fn scope(&self) -> Result<Scope> {
        let request = WatchRequest {
            scope: self.scope.into(),
            namespace: self.namespace.clone(),
            set: self.set.clone(),
            set_type: self.set_type.map(Into::into),
            pod: self.pod.clone(),
            container: self.container.clone(),
            ..WatchRequest::new(&Scope::Cluster, WatchOptions::default())
        };
        Ok(request.to_scope()?)
    }

    /// Base name for the tab
    pub fn tab_name(&self) -> String {
        match (&self.container, &self.pod, &self.set) {
            (Some(container), Some(_), _) if self.scope == ScopeArg::Container => {
                container.clone()
            }
            (_, Some(pod), _) if matches!(self.scope, ScopeArg::Pod | ScopeArg::Container) => {
                pod.clone()
            }
            (_, _, Some(set)) if self.scope == ScopeArg::Workload => set.clone(),
            _ if self.scope == ScopeArg::Cluster => "cluster".to_string(),
            _ => self.namespace.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watch(args: &[&str]) -> WatchArgs {
        let mut argv = vec!["kubestream", "watch"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Watch(args) => args,
            other => panic!("expected watch, got {:?}", other),
        }
    }

    #[test]
    fn test_serve_flags() {
        let cli = Cli::try_parse_from([
            "kubestream",
            "serve",
            "--bind",
            "127.0.0.1:9000",
            "--context",
            "prod",
            "--config",
            "/tmp/k.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/k.toml")));
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.bind.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(args.context.as_deref(), Some("prod"));
    }

    #[test]
    fn test_workload_scope() {
        let args = watch(&[
            "--scope",
            "workload",
            "-n",
            "prod",
            "--set",
            "web-7d9f",
            "--set-type",
            "replica",
            "--alarm",
            "ERROR",
            "--alarm",
            "panic",
        ]);
        assert_eq!(
            args.scope().unwrap(),
            Scope::Workload {
                namespace: "prod".to_string(),
                set: "web-7d9f".to_string(),
                set_type: Some(SetType::Replica),
            }
        );
        assert_eq!(args.alarms, vec!["ERROR", "panic"]);
        assert_eq!(args.tab_name(), "web-7d9f");
    }

    #[test]
    fn test_deployment_set_type() {
        let args = watch(&[
            "--scope", "workload", "-n", "prod", "--set", "web", "--set-type", "deployment",
        ]);
        assert_eq!(
            args.scope().unwrap(),
            Scope::Workload {
                namespace: "prod".to_string(),
                set: "web".to_string(),
                set_type: Some(SetType::Deployment),
            }
        );
    }

    #[test]
    fn test_missing_fields_rejected() {
        assert!(watch(&["--scope", "pod", "-n", "prod"]).scope().is_err());
        assert!(watch(&["--scope", "namespace"]).scope().is_err());
        assert_eq!(watch(&["--scope", "cluster"]).scope().unwrap(), Scope::Cluster);
    }

    #[test]
    fn test_container_scope_name() {
        let args = watch(&[
            "--scope", "container", "-n", "prod", "--pod", "web-0", "-c", "app",
        ]);
        assert_eq!(args.tab_name(), "app");
        assert!(args.scope().is_ok());
    }

    #[test]
    fn test_unknown_scope_rejected() {
        assert!(Cli::try_parse_from(["kubestream", "watch", "--scope", "galaxy"]).is_err());
    }
}
