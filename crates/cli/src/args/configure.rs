use clap::{Args, Subcommand};

#[derive(Debug, Clone, Args)]
#[command(args_conflicts_with_subcommands = true)]
pub struct ConfigureArgs {
    /// Admin URL of the collective, e.g. `controller.example.com`.
    pub url: Option<String>,

    #[command(subcommand)]
    pub command: Option<ConfigureCommands>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ConfigureCommands {
    /// Sign in and store the session.
    Signin(SigninArgs),
    /// Forget the stored session.
    #[command(visible_alias = "logout")]
    Signout,
}

#[derive(Debug, Clone, Default, Args)]
pub struct SigninArgs {
    /// Store the username and password for later sign-ins.
    #[arg(long)]
    pub remember_me: bool,

    /// Identity provider to sign in with.
    #[arg(long, env = "SDPCTL_PROVIDER")]
    pub provider: Option<String>,
}
