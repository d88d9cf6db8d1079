//! Who may trigger CI on a pull request.
//!
//! The sender is allowed when they own the repository, collaborate on it,
//! belong to its organization, or are listed in the default branch `OWNERS`
//! file. Failing that, an `/ok-to-test` comment from someone who passes those
//! checks grants access.

use anyhow::{Context, Result};
use async_trait::async_trait;
use forgehook_core::acl::user_in_owner_file;

use crate::{Provider, error::is_not_found, event::Event};

/// Author of a pull request comment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentAuthor {
    pub login: String,
    pub account_id: String,
}

/// Forge lookups the authorization engine is built on.
#[async_trait]
pub trait AclBackend: Provider {
    /// Whether `event.sender` may push to the repository.
    async fn is_collaborator(&self, event: &Event) -> Result<bool>;

    /// Whether `event.sender` belongs to the organization or project.
    async fn is_org_member(&self, event: &Event) -> Result<bool>;

    /// Authors of every pull request comment that is a standalone
    /// `/ok-to-test`, in page order.
    async fn ok_to_test_authors(&self, event: &Event) -> Result<Vec<CommentAuthor>>;

    /// Identities looked up in `OWNERS` for the sender.
    fn owners_identities(&self, event: &Event) -> Vec<String> { vec![event.sender.clone()] }
}

#[derive(Debug, Clone, Copy)]
pub struct AclOptions<'a> {
    pub remember_ok_to_test: bool,
    pub allowed_teams: &'a [String],
}

/// Whether `event.sender` is listed in the default branch `OWNERS` file.
/// A missing `OWNERS` file denies; a missing `OWNERS_ALIASES` means no aliases.
pub async fn owners_file_allows<B: AclBackend + ?Sized>(backend: &B, event: &Event) -> Result<bool> {
    let owners = match backend.get_file_inside_repo(event, "OWNERS", &event.default_branch).await {
        Ok(content) => content,
        Err(e) if is_not_found(&e) => return Ok(false),
        Err(e) => {
            return Err(e).with_context(|| {
                format!("cannot find OWNERS inside the {} branch", event.default_branch)
            });
        }
    };
    let aliases =
        match backend.get_file_inside_repo(event, "OWNERS_ALIASES", &event.default_branch).await {
            Ok(content) => content,
            Err(e) if is_not_found(&e) => String::new(),
            Err(e) => return Err(e).context("cannot fetch OWNERS_ALIASES"),
        };
    for identity in backend.owners_identities(event) {
        if !identity.is_empty() && user_in_owner_file(&owners, &aliases, &identity)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Owner, collaborator, organization member, then `OWNERS`; first hit wins.
pub async fn check_all<B: AclBackend + ?Sized>(backend: &B, event: &Event) -> Result<bool> {
    if !event.sender.is_empty() && event.organization == event.sender {
        return Ok(true);
    }
    if backend.is_collaborator(event).await.context("collaborator check")? {
        tracing::debug!("{} is a collaborator", event.sender);
        return Ok(true);
    }
    if backend.is_org_member(event).await.context("organization membership check")? {
        tracing::debug!("{} is an organization member", event.sender);
        return Ok(true);
    }
    backend.is_allowed_owners_file(event).await
}

/// Full decision for a pull request event.
pub async fn is_allowed<B: AclBackend + ?Sized>(
    backend: &B,
    event: &Event,
    opts: AclOptions<'_>,
) -> Result<bool> {
    let teams = opts.allowed_teams.iter().filter(|t| !t.is_empty()).cloned().collect::<Vec<_>>();
    if !opts.allowed_teams.is_empty() {
        if teams.is_empty() {
            tracing::info!("Policy set with no teams, denying {}", event.sender);
            return backend.is_allowed_owners_file(event).await;
        }
        let (allowed, reason) = backend.check_policy_allowing(event, &teams).await;
        if allowed {
            tracing::info!("Policy allows {}: {reason}", event.sender);
            return Ok(true);
        }
        if backend.is_allowed_owners_file(event).await? {
            tracing::info!("{} not in the allowed teams but listed in OWNERS", event.sender);
            return Ok(true);
        }
        tracing::info!("Policy denies {}: {reason}", event.sender);
        return Ok(false);
    }

    if check_all(backend, event).await? {
        return Ok(true);
    }
    if !opts.remember_ok_to_test {
        return Ok(false);
    }
    for author in backend.ok_to_test_authors(event).await.context("listing /ok-to-test comments")? {
        let commenter = event.with_sender(&author.login, &author.account_id);
        if check_all(backend, &commenter).await? {
            tracing::info!("{} allowed by /ok-to-test from {}", event.sender, author.login);
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::Mutex,
    };

    use anyhow::bail;
    use forgehook_core::{
        changed_files::ChangedFiles,
        config::{Provenance, ProviderKind, RepositoryConfig},
    };
    use http::HeaderMap;

    use super::*;
    use crate::{
        Detection,
        error::ForgeError,
        event::TriggerType,
        status::StatusOpts,
    };

    /// In-memory forge for exercising the decision procedure.
    #[derive(Default)]
    pub struct FakeForge {
        pub collaborators: HashSet<String>,
        pub members: HashSet<String>,
        pub files: HashMap<String, String>,
        pub ok_to_test: Vec<CommentAuthor>,
        pub team_members: HashSet<String>,
        pub checked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Provider for FakeForge {
        fn kind(&self) -> ProviderKind { ProviderKind::Gitea }

        fn detect(&self, _: &HeaderMap, _: &[u8]) -> Result<Detection> { Ok(Detection::Process) }

        fn parse_payload(&self, _: &HeaderMap, _: &[u8]) -> Result<Event> { bail!("unused") }

        fn validate(&self, _: &Event, _: &HeaderMap, _: &[u8]) -> Result<()> { Ok(()) }

        async fn set_client(&mut self, _: &mut Event, _: &RepositoryConfig) -> Result<()> {
            Ok(())
        }

        async fn get_commit_info(&self, _: &mut Event) -> Result<()> { Ok(()) }

        async fn get_tekton_dir(&self, _: &Event, _: &str, _: Provenance) -> Result<String> {
            Ok(String::new())
        }

        async fn get_file_inside_repo(&self, _: &Event, path: &str, _: &str) -> Result<String> {
            match self.files.get(path) {
                Some(content) => Ok(content.clone()),
                None => Err(ForgeError::NotFound(path.to_string()).into()),
            }
        }

        async fn get_files(&self, _: &Event) -> Result<ChangedFiles> { Ok(ChangedFiles::default()) }

        async fn create_status(&self, _: &Event, _: &StatusOpts) -> Result<()> { Ok(()) }

        async fn create_comment(&self, _: &Event, _: &str, _: Option<&str>) -> Result<()> {
            Ok(())
        }

        async fn is_allowed(&self, event: &Event) -> Result<bool> {
            is_allowed(self, event, AclOptions { remember_ok_to_test: true, allowed_teams: &[] })
                .await
        }

        async fn is_allowed_owners_file(&self, event: &Event) -> Result<bool> {
            owners_file_allows(self, event).await
        }

        async fn check_policy_allowing(&self, event: &Event, teams: &[String]) -> (bool, String) {
            if self.team_members.contains(&event.sender) {
                (true, format!("allowing user: {} as a member of the team: {}", event.sender, teams[0]))
            } else {
                (false, format!("user: {} is not a member of any of the allowed teams", event.sender))
            }
        }
    }

    #[async_trait]
    impl AclBackend for FakeForge {
        async fn is_collaborator(&self, event: &Event) -> Result<bool> {
            self.checked.lock().unwrap().push(event.sender.clone());
            Ok(self.collaborators.contains(&event.sender))
        }

        async fn is_org_member(&self, event: &Event) -> Result<bool> {
            Ok(self.members.contains(&event.sender))
        }

        async fn ok_to_test_authors(&self, _: &Event) -> Result<Vec<CommentAuthor>> {
            Ok(self.ok_to_test.clone())
        }
    }

    fn pr_event(sender: &str) -> Event {
        Event {
            sender: sender.into(),
            organization: "org".into(),
            repository: "repo".into(),
            default_branch: "main".into(),
            trigger_target: Some(TriggerType::PullRequest),
            ..Default::default()
        }
    }

    fn author(login: &str) -> CommentAuthor {
        CommentAuthor { login: login.into(), account_id: String::new() }
    }

    const DEFAULT_OPTS: AclOptions<'static> =
        AclOptions { remember_ok_to_test: true, allowed_teams: &[] };

    #[tokio::test]
    async fn test_check_all_order() {
        let forge = FakeForge {
            collaborators: HashSet::from(["collab".to_string()]),
            members: HashSet::from(["member".to_string()]),
            ..Default::default()
        };
        let cases: &[(&str, bool)] =
            &[("org", true), ("collab", true), ("member", true), ("outsider", false)];
        for &(sender, expected) in cases {
            assert_eq!(check_all(&forge, &pr_event(sender)).await.unwrap(), expected, "{sender}");
        }
        // The owner short-circuits before any API call
        assert!(!forge.checked.lock().unwrap().contains(&"org".to_string()));
    }

    #[tokio::test]
    async fn test_owners_file_with_alias() {
        let forge = FakeForge {
            files: HashMap::from([
                ("OWNERS".to_string(), "approvers:\n  - team-alias".to_string()),
                ("OWNERS_ALIASES".to_string(), "aliases:\n  team-alias:\n  - alice".to_string()),
            ]),
            ..Default::default()
        };
        assert!(is_allowed(&forge, &pr_event("alice"), DEFAULT_OPTS).await.unwrap());
        assert!(!is_allowed(&forge, &pr_event("bob"), DEFAULT_OPTS).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_owners_denies() {
        let forge = FakeForge::default();
        assert!(!owners_file_allows(&forge, &pr_event("alice")).await.unwrap());

        let forge = FakeForge {
            files: HashMap::from([("OWNERS".to_string(), "reviewers: [alice]".to_string())]),
            ..Default::default()
        };
        assert!(owners_file_allows(&forge, &pr_event("alice")).await.unwrap());
    }

    #[tokio::test]
    async fn test_ok_to_test_from_member() {
        let forge = FakeForge {
            members: HashSet::from(["owner".to_string()]),
            ok_to_test: vec![author("random"), author("owner")],
            ..Default::default()
        };
        assert!(is_allowed(&forge, &pr_event("outsider"), DEFAULT_OPTS).await.unwrap());

        let opts = AclOptions { remember_ok_to_test: false, ..DEFAULT_OPTS };
        assert!(!is_allowed(&forge, &pr_event("outsider"), opts).await.unwrap());

        let forge = FakeForge { ok_to_test: vec![author("random")], ..Default::default() };
        assert!(!is_allowed(&forge, &pr_event("outsider"), DEFAULT_OPTS).await.unwrap());
    }

    #[tokio::test]
    async fn test_policy_overlay() {
        let teams = vec!["ci".to_string()];
        let opts = AclOptions { remember_ok_to_test: true, allowed_teams: &teams };
        let forge = FakeForge {
            team_members: HashSet::from(["alice".to_string()]),
            members: HashSet::from(["bob".to_string()]),
            files: HashMap::from([("OWNERS".to_string(), "approvers: [carol]".to_string())]),
            ..Default::default()
        };
        assert!(is_allowed(&forge, &pr_event("alice"), opts).await.unwrap());
        // Organization membership does not bypass a team policy
        assert!(!is_allowed(&forge, &pr_event("bob"), opts).await.unwrap());
        // OWNERS still does
        assert!(is_allowed(&forge, &pr_event("carol"), opts).await.unwrap());
    }
}
