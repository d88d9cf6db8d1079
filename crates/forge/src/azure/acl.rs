use anyhow::{Context, Result};
use async_trait::async_trait;
use forgehook_core::acl::{OK_TO_TEST_COMMENT_REGEXP, match_regexp};
use reqwest::Method;

use super::{
    AzureDevOps,
    types::{CommentThread, IdentityRef, Team, TeamMember, ValueList},
};
use crate::{
    authorize::{AclBackend, CommentAuthor},
    event::Event,
};

/// Identities are matched on the user id, or on the unique name (usually
/// an email) carried in `account_id`.
fn is_sender(identity: &IdentityRef, event: &Event) -> bool {
    (!event.sender.is_empty() && identity.id == event.sender)
        || (!event.account_id.is_empty() && identity.unique_name.eq_ignore_ascii_case(&event.account_id))
}

impl AzureDevOps {
    async fn project_teams(&self, event: &Event) -> Result<Vec<Team>> {
        let path = format!("_apis/projects/{}/teams", event.project_id);
        let teams: ValueList<Team> = self.get_json(self.request(Method::GET, &path)?).await?;
        Ok(teams.value)
    }

    async fn is_team_member(&self, event: &Event, team: &Team) -> Result<bool> {
        let path = format!("_apis/projects/{}/teams/{}/members", event.project_id, team.id);
        let members: ValueList<TeamMember> = self.get_json(self.request(Method::GET, &path)?).await?;
        Ok(members.value.iter().any(|m| is_sender(&m.identity, event)))
    }
}

#[async_trait]
impl AclBackend for AzureDevOps {
    /// Repositories have no collaborator list of their own.
    async fn is_collaborator(&self, _event: &Event) -> Result<bool> { Ok(false) }

    /// Member of any team of the project.
    async fn is_org_member(&self, event: &Event) -> Result<bool> {
        for team in self.project_teams(event).await.context("failed to list project teams")? {
            match self.is_team_member(event, &team).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => tracing::debug!("Skipping team {}: {e:#}", team.name),
            }
        }
        Ok(false)
    }

    async fn ok_to_test_authors(&self, event: &Event) -> Result<Vec<CommentAuthor>> {
        let path = Self::git_path(event, &format!("pullRequests/{}/threads", event.pull_request_number));
        let threads: ValueList<CommentThread> = self.get_json(self.request(Method::GET, &path)?).await?;
        Ok(threads
            .value
            .into_iter()
            .flat_map(|thread| thread.comments)
            .filter(|comment| match_regexp(OK_TO_TEST_COMMENT_REGEXP, &comment.content))
            .map(|comment| CommentAuthor {
                login: comment.author.id,
                account_id: comment.author.unique_name,
            })
            .collect())
    }

    fn owners_identities(&self, event: &Event) -> Vec<String> {
        vec![event.sender.clone(), event.account_id.clone()]
    }
}

pub(super) async fn check_policy_allowing(
    provider: &AzureDevOps,
    event: &Event,
    teams: &[String],
) -> (bool, String) {
    let project_teams = match provider.project_teams(event).await {
        Ok(project_teams) => project_teams,
        Err(e) => return (false, format!("error while getting project teams, error: {e:#}")),
    };
    for team in project_teams.iter().filter(|t| teams.contains(&t.name)) {
        match provider.is_team_member(event, team).await {
            Ok(true) => {
                return (
                    true,
                    format!("allowing user: {} as a member of the team: {}", event.sender, team.name),
                );
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("Cannot list members of team {}: {e:#}", team.name),
        }
    }
    (false, format!("user: {} is not a member of any of the allowed teams: {teams:?}", event.sender))
}
