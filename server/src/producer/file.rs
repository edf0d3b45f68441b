//! Static file passthrough

use super::{default_mask, validate_mask, validate_product_name, Context, Producer};
use crate::error::{ConfigError, ProducerError};
use crate::expr::Expression;
use serde::Deserialize;
use shared::task::{Task, TaskKey};
use shared::Product;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    from: Option<PathBuf>,
    #[serde(default)]
    content: Expression,
    #[serde(default)]
    path: Option<Vec<String>>,
    #[serde(default = "default_mask")]
    mask: u32,
}

#[derive(Debug)]
enum Source {
    File(PathBuf),
    Content(Expression),
}

/// Delivers one product whose body is a file on the server or a
/// configured string; needs nothing from the client.
#[derive(Debug)]
pub struct FileProducer {
    name: String,
    source: Source,
    product_name: Vec<String>,
    mask: u32,
}

impl FileProducer {
    #[cfg(test)]
    pub fn from_path(name: impl Into<String>, from: PathBuf, mask: u32) -> Self {
        let name = name.into();
        Self {
            product_name: vec![name.clone()],
            name,
            source: Source::File(from),
            mask,
        }
    }
}

impl Producer for FileProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    fn prepare(&self, _ctx: &Context<'_>) -> Result<Vec<(TaskKey, Task)>, ProducerError> {
        Ok(Vec::new())
    }

    fn produce(&self, ctx: &Context<'_>) -> Result<Vec<Product>, ProducerError> {
        let body = match &self.source {
            Source::File(path) => std::fs::read(path).map_err(|source| ProducerError::Read {
                path: path.clone(),
                source,
            })?,
            Source::Content(expr) => expr.eval_string(ctx.env)?.into_bytes(),
        };

        Ok(vec![Product {
            name: self.product_name.clone(),
            mask: self.mask,
            body,
        }])
    }
}

/// Construct a `file` producer from its configuration block
pub fn new(name: &str, config: serde_yaml::Value) -> Result<Box<dyn Producer>, ConfigError> {
    let what = format!("file producer '{}'", name);
    let config: FileConfig =
        serde_yaml::from_value(config).map_err(|source| ConfigError::Invalid {
            what: what.clone(),
            source,
        })?;

    let source = match (config.from, config.content) {
        (Some(path), Expression::Null) => Source::File(path),
        (None, content) if !content.is_null() => Source::Content(content),
        _ => {
            return Err(ConfigError::rejected(
                what,
                "exactly one of `from` or `content` is required",
            ))
        }
    };

    let product_name = config.path.unwrap_or_else(|| vec![name.to_string()]);
    validate_product_name(&what, &product_name)?;
    validate_mask(&what, config.mask)?;

    Ok(Box::new(FileProducer {
        name: name.to_string(),
        source,
        product_name,
        mask: config.mask,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backends;
    use crate::expr::Environment;
    use crate::producer::TaskResponses;
    use shared::MachineInfo;

    fn run(producer: &dyn Producer) -> Result<Vec<Product>, ProducerError> {
        let machine = MachineInfo {
            fqdn: "db-3.example.com".to_string(),
            ..Default::default()
        };
        let env = Environment::for_request(&machine, None, std::iter::empty());
        let backends = Backends::new();
        let responses = TaskResponses::new();
        let ctx = Context {
            env: &env,
            backends: &backends,
            responses: &responses,
        };
        assert!(producer.prepare(&ctx)?.is_empty());
        producer.produce(&ctx)
    }

    #[test]
    fn reads_source_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("motd");
        std::fs::write(&src, b"welcome\n").unwrap();

        let yaml = format!("{{from: '{}', path: [etc, motd], mask: 0o644}}", src.display());
        let producer = new("motd", serde_yaml::from_str(&yaml).unwrap()).unwrap();

        let products = run(producer.as_ref()).unwrap();
        assert_eq!(
            products,
            vec![Product {
                name: vec!["etc".to_string(), "motd".to_string()],
                mask: 0o644,
                body: b"welcome\n".to_vec(),
            }]
        );
    }

    #[test]
    fn content_is_evaluated() {
        let producer = new(
            "hostname",
            serde_yaml::from_str("{content: '${req.fqdn}'}").unwrap(),
        )
        .unwrap();

        let products = run(producer.as_ref()).unwrap();
        assert_eq!(products[0].name, vec!["hostname"]);
        assert_eq!(products[0].mask, 0o400);
        assert_eq!(products[0].body, b"db-3.example.com");
    }

    #[test]
    fn produce_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("bundle.pem");
        std::fs::write(&src, b"-----BEGIN CERTIFICATE-----\n").unwrap();
        let producer = FileProducer::from_path("bundle", src, 0o444);

        assert_eq!(run(&producer).unwrap(), run(&producer).unwrap());
    }

    #[test]
    fn missing_source_fails_at_produce() {
        let producer = FileProducer::from_path("gone", PathBuf::from("/nonexistent/redoubt"), 0o400);
        assert!(matches!(run(&producer), Err(ProducerError::Read { .. })));
    }

    #[test]
    fn needs_exactly_one_source() {
        for yaml in ["{}", "{from: /a, content: b}"] {
            let res = new("x", serde_yaml::from_str(yaml).unwrap());
            assert!(matches!(res, Err(ConfigError::Rejected { .. })), "{}", yaml);
        }
    }

    #[test]
    fn rejects_escaping_path() {
        let res = new(
            "x",
            serde_yaml::from_str("{content: a, path: ['..', passwd]}").unwrap(),
        );
        assert!(matches!(res, Err(ConfigError::Rejected { .. })));
    }
}
