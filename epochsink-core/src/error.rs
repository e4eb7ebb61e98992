use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Writer Error - {0}")]
    Writer(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Coordinator Error - {0}")]
    Coordinator(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Sink(err.to_string())
    }
}
