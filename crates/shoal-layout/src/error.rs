use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("json parse error in {path}: {source}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("yaml parse error in {path}: {source}")]
    YamlParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid layout in {path}: {message}")]
    Invalid { path: String, message: String },

    #[error("layout mixes \"<any>\" with specific compute nodes")]
    MixedAny,

    #[error("cannot identify a unique head node ({0} candidates)")]
    HeadNodeNotUnique(usize),

    #[error("no image published for service {0}")]
    MissingImage(String),

    #[error("domain error: {0}")]
    Domain(#[from] shoal_domain::DomainError),
}
