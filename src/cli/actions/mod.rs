pub mod server;

/// Work selected on the command line.
#[derive(Debug)]
pub enum Action {
    Server(Box<server::Args>),
}

impl Action {
    /// # Errors
    /// Returns an error if the gateway fails to start or stops abnormally.
    pub async fn execute(self) -> anyhow::Result<()> {
        match self {
            Self::Server(args) => server::execute(*args).await,
        }
    }
}
