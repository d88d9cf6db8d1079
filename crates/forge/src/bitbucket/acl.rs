use anyhow::Result;
use async_trait::async_trait;
use forgehook_core::acl::{OK_TO_TEST_COMMENT_REGEXP, match_regexp};

use super::{
    BitbucketDataCenter,
    types::{Activity, UserPermission},
};
use crate::{
    authorize::{AclBackend, CommentAuthor},
    event::Event,
};

/// Permission rows match on the numeric account id; the slug is a fallback
/// for events that only carry a user name.
fn has_permission(rows: &[UserPermission], event: &Event) -> bool {
    let account_id = event.account_id.parse::<u64>().ok();
    rows.iter().any(|row| {
        Some(row.user.id) == account_id
            || (!event.sender.is_empty()
                && (row.user.slug == event.sender || row.user.name == event.sender))
    })
}

#[async_trait]
impl AclBackend for BitbucketDataCenter {
    async fn is_collaborator(&self, event: &Event) -> Result<bool> {
        let rows: Vec<UserPermission> =
            self.list_all(&format!("{}/permissions/users", self.repo_path(event))).await?;
        Ok(has_permission(&rows, event))
    }

    async fn is_org_member(&self, event: &Event) -> Result<bool> {
        let rows: Vec<UserPermission> =
            self.list_all(&format!("api/1.0/projects/{}/permissions/users", self.project_key)).await?;
        Ok(has_permission(&rows, event))
    }

    async fn ok_to_test_authors(&self, event: &Event) -> Result<Vec<CommentAuthor>> {
        let path = format!(
            "{}/pull-requests/{}/activities?fromType=COMMENT",
            self.repo_path(event),
            event.pull_request_number
        );
        let activities: Vec<Activity> = self.list_all(&path).await?;
        Ok(activities
            .into_iter()
            .filter_map(|activity| activity.comment)
            .filter(|comment| match_regexp(OK_TO_TEST_COMMENT_REGEXP, &comment.text))
            .map(|comment| CommentAuthor {
                login: comment.author.slug,
                account_id: comment.author.id.to_string(),
            })
            .collect())
    }

    /// `OWNERS` files on Bitbucket list account ids; user names are accepted too.
    fn owners_identities(&self, event: &Event) -> Vec<String> {
        vec![event.account_id.clone(), event.sender.clone()]
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path, query_param},
    };

    use super::*;
    use crate::{Provider, bitbucket::tests::connected};

    async fn mount_permissions(server: &MockServer, route: &str, pages: &[(u64, &[u64], bool)]) {
        for &(start, ids, last) in pages {
            let values = ids
                .iter()
                .map(|id| json!({"user": {"id": id, "slug": format!("user{id}")}, "permission": "REPO_WRITE"}))
                .collect::<Vec<_>>();
            Mock::given(method("GET"))
                .and(path(route))
                .and(query_param("start", start.to_string()))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "values": values,
                    "isLastPage": last,
                    "nextPageStart": start + ids.len() as u64,
                })))
                .mount(server)
                .await;
        }
    }

    #[tokio::test]
    async fn test_project_permission_paginates() {
        let server = MockServer::start().await;
        let (provider, mut event) = connected(&server).await;
        let full_page = (100..200).collect::<Vec<u64>>();
        mount_permissions(&server, "/rest/api/1.0/projects/PROJ/permissions/users", &[
            (0, &full_page, false),
            (100, &[7], true),
        ])
        .await;
        event.sender = "someone".into();
        assert!(provider.is_org_member(&event).await.unwrap());
    }

    #[tokio::test]
    async fn test_ok_to_test_from_repo_writer() {
        let server = MockServer::start().await;
        let (provider, mut event) = connected(&server).await;
        event.sender = "outsider".into();
        event.account_id = "99".into();
        mount_permissions(&server, "/rest/api/1.0/projects/PROJ/repos/repo/permissions/users", &[(
            0,
            &[42],
            true,
        )])
        .await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/PROJ/permissions/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": [], "isLastPage": true})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/PROJ/repos/repo/raw/OWNERS"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/PROJ/repos/repo/pull-requests/12/activities"))
            .and(query_param("fromType", "COMMENT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "values": [
                    {"action": "COMMENTED", "comment": {"text": "  /ok-to-test", "author": {"id": 42, "slug": "user42"}}},
                    {"action": "OPENED"},
                    {"action": "COMMENTED", "comment": {"text": "/ok-to-test", "author": {"id": 42, "slug": "user42"}}},
                ],
                "isLastPage": true,
            })))
            .mount(&server)
            .await;

        let authors = provider.ok_to_test_authors(&event).await.unwrap();
        assert_eq!(authors, [CommentAuthor { login: "user42".into(), account_id: "42".into() }]);
        assert!(provider.is_allowed(&event).await.unwrap());
    }

    #[test]
    fn test_has_permission() {
        let rows: Vec<UserPermission> = serde_json::from_value(json!([
            {"user": {"id": 7, "slug": "jdoe", "name": "jdoe"}, "permission": "PROJECT_READ"}
        ]))
        .unwrap();
        let event = |sender: &str, account_id: &str| Event {
            sender: sender.into(),
            account_id: account_id.into(),
            ..Default::default()
        };
        assert!(has_permission(&rows, &event("other", "7")));
        assert!(has_permission(&rows, &event("jdoe", "")));
        assert!(!has_permission(&rows, &event("other", "8")));
        assert!(!has_permission(&rows, &event("", "")));
    }
}
