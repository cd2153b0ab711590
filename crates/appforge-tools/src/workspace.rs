//! Workspace file tools.
//!
//! All paths resolve relative to the context's workspace root through
//! [`secure_join`]; writes are atomic (write-temp-then-rename). Failures are
//! returned as error-marked results so the model can react.

use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use appforge_contract::{gen_id, ToolError, ToolInvocation, ToolResult, TypedTool};

use crate::paths::secure_join;

const GREP_MAX_MATCHES: usize = 200;
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "target", ".next", "dist"];

fn resolve(call: &ToolInvocation<'_>, path: &str) -> Result<PathBuf, ToolResult> {
    secure_join(&call.ctx.workspace_path, path)
        .map_err(|e| ToolResult::error("workspace", e.to_string()))
}

pub struct ReadFileTool;

#[derive(Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    /// File path relative to the workspace root, e.g. "src/main.py".
    pub path: String,
}

#[async_trait]
impl TypedTool for ReadFileTool {
    type Args = ReadFileArgs;

    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the content of a file in the workspace"
    }

    async fn execute(
        &self,
        args: ReadFileArgs,
        call: &ToolInvocation<'_>,
    ) -> Result<ToolResult, ToolError> {
        let path = match resolve(call, &args.path) {
            Ok(p) => p,
            Err(result) => return Ok(result),
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(ToolResult::success("read_file", content)),
            Err(e) => Ok(ToolResult::error(
                "read_file",
                format!("cannot read {}: {e}", args.path),
            )),
        }
    }
}

pub struct WriteFileTool;

#[derive(Deserialize, JsonSchema)]
pub struct WriteFileArgs {
    /// File path relative to the workspace root.
    pub path: String,
    /// Full content to write.
    pub content: String,
}

#[async_trait]
impl TypedTool for WriteFileTool {
    type Args = WriteFileArgs;

    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the workspace, creating parent directories as needed"
    }

    async fn execute(
        &self,
        args: WriteFileArgs,
        call: &ToolInvocation<'_>,
    ) -> Result<ToolResult, ToolError> {
        let path = match resolve(call, &args.path) {
            Ok(p) => p,
            Err(result) => return Ok(result),
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Ok(ToolResult::error(
                    "write_file",
                    format!("cannot create parent directories: {e}"),
                ));
            }
        }
        // Atomic write: temp file in the same directory, then rename.
        let tmp = path.with_extension(format!("tmp-{}", gen_id("w")));
        if let Err(e) = tokio::fs::write(&tmp, args.content.as_bytes()).await {
            return Ok(ToolResult::error("write_file", format!("write failed: {e}")));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Ok(ToolResult::error("write_file", format!("rename failed: {e}")));
        }
        Ok(ToolResult::success(
            "write_file",
            format!("wrote {} bytes to {}", args.content.len(), args.path),
        ))
    }
}

pub struct ListFilesTool;

#[derive(Deserialize, JsonSchema)]
pub struct ListFilesArgs {
    /// Directory relative to the workspace root; defaults to the root.
    #[serde(default)]
    pub directory: Option<String>,
}

#[async_trait]
impl TypedTool for ListFilesTool {
    type Args = ListFilesArgs;

    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files and subdirectories of a workspace directory"
    }

    async fn execute(
        &self,
        args: ListFilesArgs,
        call: &ToolInvocation<'_>,
    ) -> Result<ToolResult, ToolError> {
        let dir = args.directory.unwrap_or_else(|| ".".to_string());
        let path = match resolve(call, &dir) {
            Ok(p) => p,
            Err(result) => return Ok(result),
        };
        let mut reader = match tokio::fs::read_dir(&path).await {
            Ok(r) => r,
            Err(e) => {
                return Ok(ToolResult::error(
                    "list_files",
                    format!("cannot list {dir}: {e}"),
                ))
            }
        };
        let mut entries = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => entries.push(format!("[dir]  {name}/")),
                Ok(_) => {
                    let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                    entries.push(format!("[file] {name} ({size} bytes)"));
                }
                Err(_) => entries.push(format!("[?]    {name}")),
            }
        }
        entries.sort();
        let output = if entries.is_empty() {
            format!("directory {dir} is empty")
        } else {
            entries.join("\n")
        };
        Ok(ToolResult::success("list_files", output))
    }
}

pub struct DeleteFileTool;

#[derive(Deserialize, JsonSchema)]
pub struct DeleteFileArgs {
    /// File path relative to the workspace root.
    pub path: String,
}

#[async_trait]
impl TypedTool for DeleteFileTool {
    type Args = DeleteFileArgs;

    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file in the workspace"
    }

    async fn execute(
        &self,
        args: DeleteFileArgs,
        call: &ToolInvocation<'_>,
    ) -> Result<ToolResult, ToolError> {
        let path = match resolve(call, &args.path) {
            Ok(p) => p,
            Err(result) => return Ok(result),
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(ToolResult::success(
                "delete_file",
                format!("deleted {}", args.path),
            )),
            Err(e) => Ok(ToolResult::error(
                "delete_file",
                format!("cannot delete {}: {e}", args.path),
            )),
        }
    }
}

pub struct MakeDirTool;

#[derive(Deserialize, JsonSchema)]
pub struct MakeDirArgs {
    /// Directory path relative to the workspace root.
    pub path: String,
}

#[async_trait]
impl TypedTool for MakeDirTool {
    type Args = MakeDirArgs;

    fn name(&self) -> &str {
        "make_dir"
    }

    fn description(&self) -> &str {
        "Create a directory (and parents) in the workspace"
    }

    async fn execute(
        &self,
        args: MakeDirArgs,
        call: &ToolInvocation<'_>,
    ) -> Result<ToolResult, ToolError> {
        let path = match resolve(call, &args.path) {
            Ok(p) => p,
            Err(result) => return Ok(result),
        };
        match tokio::fs::create_dir_all(&path).await {
            Ok(()) => Ok(ToolResult::success(
                "make_dir",
                format!("created {}", args.path),
            )),
            Err(e) => Ok(ToolResult::error(
                "make_dir",
                format!("cannot create {}: {e}", args.path),
            )),
        }
    }
}

pub struct GrepFilesTool;

#[derive(Deserialize, JsonSchema)]
pub struct GrepFilesArgs {
    /// Regular expression to search for.
    pub pattern: String,
    /// Directory relative to the workspace root; defaults to the root.
    #[serde(default)]
    pub directory: Option<String>,
}

#[async_trait]
impl TypedTool for GrepFilesTool {
    type Args = GrepFilesArgs;

    fn name(&self) -> &str {
        "grep_files"
    }

    fn description(&self) -> &str {
        "Search workspace files for a regular expression; returns file:line matches"
    }

    async fn execute(
        &self,
        args: GrepFilesArgs,
        call: &ToolInvocation<'_>,
    ) -> Result<ToolResult, ToolError> {
        let regex = match Regex::new(&args.pattern) {
            Ok(r) => r,
            Err(e) => {
                return Ok(ToolResult::error(
                    "grep_files",
                    format!("invalid pattern: {e}"),
                ))
            }
        };
        let dir = args.directory.unwrap_or_else(|| ".".to_string());
        let root = match resolve(call, &dir) {
            Ok(p) => p,
            Err(result) => return Ok(result),
        };
        let workspace_root = call.ctx.workspace_path.clone();
        let matches =
            tokio::task::spawn_blocking(move || grep_dir(&root, &workspace_root, &regex))
                .await
                .map_err(|e| ToolError::Internal(e.to_string()))?;
        let output = if matches.is_empty() {
            "no matches".to_string()
        } else {
            matches.join("\n")
        };
        Ok(ToolResult::success("grep_files", output))
    }
}

fn grep_dir(root: &Path, workspace_root: &Path, regex: &Regex) -> Vec<String> {
    let mut matches = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(reader) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in reader.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_str()) {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue; // binary or unreadable
            };
            let display = path
                .strip_prefix(workspace_root)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            for (line_no, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(format!("{display}:{}: {}", line_no + 1, line.trim_end()));
                    if matches.len() >= GREP_MAX_MATCHES {
                        return matches;
                    }
                }
            }
        }
    }
    matches
}
