//! Prompt list and workflow graph loading.

use std::path::Path;

use anyhow::Context;

use genqueue_pipeline::workflow::WorkflowTemplate;

/// Split a prompt file into prompts: one per line, trimmed. Blank lines
/// and lines starting with `#` are skipped.
pub fn parse_prompts(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub async fn load_prompts(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading prompts from {}", path.display()))?;
    let prompts = parse_prompts(&text);
    if prompts.is_empty() {
        anyhow::bail!("{} contains no prompts", path.display());
    }
    Ok(prompts)
}

/// Load an API-format ComfyUI graph and map its well-known inputs.
pub async fn load_workflow(path: &Path) -> anyhow::Result<WorkflowTemplate> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading workflow from {}", path.display()))?;
    let graph: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("parsing workflow JSON in {}", path.display()))?;
    WorkflowTemplate::from_graph(graph)
        .map_err(|e| anyhow::anyhow!("invalid workflow {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let text = "# batch one\n\na red fox\n   \n  a lighthouse at dusk  \n#skip me\nrain\n";
        assert_eq!(parse_prompts(text), vec!["a red fox", "a lighthouse at dusk", "rain"]);
    }

    #[tokio::test]
    async fn load_prompts_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompts.txt");
        std::fs::write(&path, "one\ntwo\n").unwrap();

        assert_eq!(load_prompts(&path).await.unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn empty_prompt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompts.txt");
        std::fs::write(&path, "# nothing here\n\n").unwrap();

        let err = load_prompts(&path).await.unwrap_err();
        assert!(err.to_string().contains("no prompts"));
    }

    #[tokio::test]
    async fn missing_file_names_path() {
        let err = load_prompts(Path::new("/nonexistent/prompts.txt")).await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/prompts.txt"));
    }

    #[tokio::test]
    async fn load_workflow_maps_prompt_node() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.json");
        std::fs::write(
            &path,
            r#"{
                "3": {"class_type": "KSampler", "inputs": {"seed": 1, "steps": 20}},
                "6": {"class_type": "CLIPTextEncode", "inputs": {"text": ""}},
                "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "ComfyUI"}}
            }"#,
        )
        .unwrap();

        let template = load_workflow(&path).await.unwrap();
        assert_eq!(template.mappings()["prompt"].node_id, "6");
    }

    #[tokio::test]
    async fn malformed_workflow_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(load_workflow(&path).await.is_err());
    }
}
