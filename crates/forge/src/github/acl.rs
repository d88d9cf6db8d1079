use anyhow::Result;
use async_trait::async_trait;
use forgehook_core::acl::{OK_TO_TEST_COMMENT_REGEXP, match_regexp};

use super::{GitHub, types::Team};
use crate::{
    authorize::{AclBackend, CommentAuthor},
    error::is_not_found,
    event::Event,
};

#[async_trait]
impl AclBackend for GitHub {
    async fn is_collaborator(&self, event: &Event) -> Result<bool> {
        self.exists(&format!("{}/collaborators/{}", Self::repo_path(event), event.sender)).await
    }

    async fn is_org_member(&self, event: &Event) -> Result<bool> {
        self.exists(&format!("/orgs/{}/members/{}", event.organization, event.sender)).await
    }

    async fn ok_to_test_authors(&self, event: &Event) -> Result<Vec<CommentAuthor>> {
        Ok(self
            .pull_request_comments(event)
            .await?
            .into_iter()
            .filter(|comment| match_regexp(OK_TO_TEST_COMMENT_REGEXP, &comment.body))
            .map(|comment| CommentAuthor {
                login: comment.user.login,
                account_id: comment.user.id.to_string(),
            })
            .collect())
    }
}

/// Whether the sender belongs to one of `teams`, matched on slug or name.
pub(super) async fn check_policy_allowing(
    provider: &GitHub,
    event: &Event,
    teams: &[String],
) -> (bool, String) {
    let org_teams: Vec<Team> = match provider.list_all(&format!("/orgs/{}/teams", event.organization)).await {
        Ok(org_teams) => org_teams,
        Err(e) if is_not_found(&e) => {
            return (false, format!("no teams on org {}", event.organization));
        }
        Err(e) => return (false, format!("error while getting org team, error: {e:#}")),
    };

    for team in org_teams.iter().filter(|t| teams.contains(&t.slug) || teams.contains(&t.name)) {
        let route = format!("/orgs/{}/teams/{}/memberships/{}", event.organization, team.slug, event.sender);
        match provider.exists(&route).await {
            Ok(true) => {
                return (
                    true,
                    format!("allowing user: {} as a member of the team: {}", event.sender, team.slug),
                );
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("Cannot check membership of team {}: {e:#}", team.slug),
        }
    }
    (false, format!("user: {} is not a member of any of the allowed teams: {teams:?}", event.sender))
}
