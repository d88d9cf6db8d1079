//! Concatenation of a repository's pipeline manifests into one YAML stream.

use anyhow::{Result, anyhow};
use serde::Deserialize;

pub fn is_yaml_file(path: &str) -> bool { path.ends_with(".yaml") || path.ends_with(".yml") }

/// Every document in `data` must parse as YAML.
pub fn validate_yaml(data: &str, path: &str) -> Result<()> {
    for document in serde_yaml::Deserializer::from_str(data) {
        serde_yaml::Value::deserialize(document)
            .map_err(|e| anyhow!("error unmarshalling yaml file {path}: {e}"))?;
    }
    Ok(())
}

/// Appends validated manifest files into one stream, separating documents
/// with `---` unless the next file already starts with one.
#[derive(Debug, Default)]
pub struct ManifestBuilder {
    out: String,
}

impl ManifestBuilder {
    pub fn push(&mut self, path: &str, data: &str) -> Result<()> {
        validate_yaml(data, path)?;
        if !self.out.is_empty() && !data.starts_with("---") {
            self.out.push_str("---");
        }
        self.out.push('\n');
        self.out.push_str(data);
        self.out.push('\n');
        Ok(())
    }

    pub fn finish(self) -> String { self.out }
}

/// Concatenate `(path, content)` pairs, skipping non-YAML paths.
pub fn concat_yaml_files<'a>(files: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<String> {
    let mut builder = ManifestBuilder::default();
    for (path, data) in files {
        if is_yaml_file(path) {
            builder.push(path, data)?;
        }
    }
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_yaml_files() {
        let out = concat_yaml_files([
            (".tekton/a.yaml", "kind: PipelineRun\nname: a"),
            (".tekton/README.md", "# not yaml"),
            (".tekton/b.yml", "kind: PipelineRun\nname: b"),
            (".tekton/c.yaml", "---\nkind: Pipeline"),
        ])
        .unwrap();
        assert_eq!(
            out,
            "\nkind: PipelineRun\nname: a\n---\nkind: PipelineRun\nname: b\n\n---\nkind: Pipeline\n"
        );
        let documents = serde_yaml::Deserializer::from_str(&out).count();
        assert_eq!(documents, 3);
    }

    #[test]
    fn test_concat_yaml_files_invalid() {
        let err = concat_yaml_files([(".tekton/bad.yaml", "key: [unclosed")]).unwrap_err();
        assert!(
            err.to_string().starts_with("error unmarshalling yaml file .tekton/bad.yaml: "),
            "{err}"
        );
        assert_eq!(concat_yaml_files([]).unwrap(), "");
    }

    #[test]
    fn test_multi_document_file() {
        assert!(validate_yaml("a: 1\n---\nb: 2\n", "x.yaml").is_ok());
        assert!(validate_yaml("a: 1\n---\nb: [\n", "x.yaml").is_err());
    }
}
