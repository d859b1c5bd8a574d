//! HuggingFace repo/file → URL builder (§6.4 external collaborator).

/// Builds a `resolve/main` download URL for a file in a HuggingFace repo.
/// `repo` is the usual `org/name` coordinate; `file` is the path within the repo.
pub fn resolve_url(repo: &str, file: &str) -> String {
    format!(
        "https://huggingface.co/{}/resolve/main/{}",
        repo.trim_matches('/'),
        file.trim_start_matches('/')
    )
}
