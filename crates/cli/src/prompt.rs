use std::fs;

use anyhow::{Context, Result, bail};

use crate::args::PromptArgs;

/// Prompt text from `--prompt-file` or `--prompt`, trimmed of trailing whitespace.
pub fn load_prompt(args: &PromptArgs) -> Result<String> {
    let prompt = match (&args.prompt_file, &args.prompt) {
        (Some(path), _) => fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt file {}", path.display()))?,
        (None, Some(text)) => text.clone(),
        (None, None) => bail!("prompt is required (use --prompt or --prompt-file)"),
    };
    let prompt = prompt.trim_end();
    if prompt.is_empty() {
        bail!("prompt is empty");
    }
    Ok(prompt.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_prompts_are_rejected() {
        let args = PromptArgs {
            prompt: Some("  \n".into()),
            prompt_file: None,
        };
        assert!(load_prompt(&args).is_err());
    }

    #[test]
    fn prompt_file_is_read_and_trimmed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("prompt.txt");
        fs::write(&path, "Describe the chest X-ray.\n\n")?;
        let args = PromptArgs {
            prompt: None,
            prompt_file: Some(path),
        };
        assert_eq!(load_prompt(&args)?, "Describe the chest X-ray.");
        Ok(())
    }
}
