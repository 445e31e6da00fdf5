use parley_core::{ChatScope, MessageId, RoomId, UserId, UserPair};
use parley_protocol::ChatMessage;
use serde::Serialize;

use super::{
    core::{AppState, AuthContext},
    errors::ApiFailure,
    storage::{repository, ChatPersistence, UnreadCount},
};

/// One page of history, oldest message first.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct HistoryPage {
    pub(crate) messages: Vec<ChatMessage>,
    pub(crate) has_more: bool,
    pub(crate) next_cursor: Option<String>,
}

/// Turns up to `limit + 1` newest-first rows into a page. The extra row only
/// signals that older messages exist and is never returned.
pub(crate) fn page_from_rows(mut rows: Vec<ChatMessage>, limit: usize) -> HistoryPage {
    let has_more = rows.len() > limit;
    rows.truncate(limit);
    rows.reverse();
    let next_cursor = if has_more {
        rows.first().map(|oldest| oldest.message_id().to_owned())
    } else {
        None
    };
    HistoryPage {
        messages: rows,
        has_more,
        next_cursor,
    }
}

pub(crate) fn parse_cursor(cursor: Option<&str>) -> Result<Option<MessageId>, ApiFailure> {
    cursor
        .map(|value| MessageId::try_from(value).map_err(|_| ApiFailure::Validation("cursor")))
        .transpose()
}

async fn fetch_page(
    state: &AppState,
    scope: ChatScope,
    cursor: Option<MessageId>,
) -> Result<HistoryPage, ApiFailure> {
    let limit = state.runtime.history_page_limit;
    let rows = repository(state)
        .await?
        .messages_before(scope, cursor, limit + 1)
        .await?;
    Ok(page_from_rows(rows, limit))
}

/// Room history is readable only by current members of an existing room.
pub(crate) async fn room_history(
    state: &AppState,
    auth: &AuthContext,
    room_id: RoomId,
    cursor: Option<MessageId>,
) -> Result<HistoryPage, ApiFailure> {
    let repo = repository(state).await?;
    if repo.find_room(room_id).await?.is_none() {
        return Err(ApiFailure::NotFound);
    }
    if !repo.is_member(auth.user_id, room_id).await? {
        return Err(ApiFailure::Forbidden);
    }
    fetch_page(state, ChatScope::Room(room_id), cursor).await
}

/// Opening a direct conversation marks everything the partner sent to the
/// caller as read before the page is read back.
pub(crate) async fn direct_history(
    state: &AppState,
    auth: &AuthContext,
    partner_id: UserId,
    cursor: Option<MessageId>,
) -> Result<HistoryPage, ApiFailure> {
    let pair = UserPair::new(auth.user_id, partner_id).map_err(ApiFailure::from)?;
    let repo = repository(state).await?;
    if repo.find_user(partner_id).await?.is_none() {
        return Err(ApiFailure::NotFound);
    }
    let flipped = repo.mark_direct_read(auth.user_id, partner_id).await?;
    if flipped > 0 {
        tracing::debug!(
            event = "history.mark_read",
            reader_id = %auth.user_id,
            partner_id = %partner_id,
            flipped
        );
    }
    fetch_page(state, ChatScope::Direct(pair), cursor).await
}

pub(crate) async fn unread_counts(
    state: &AppState,
    auth: &AuthContext,
) -> Result<Vec<UnreadCount>, ApiFailure> {
    repository(state).await?.unread_counts(auth.user_id).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parley_core::{MessageContent, UserId};
    use parley_protocol::{ChatMessage, RoomMessage, UserSummary};

    use super::{direct_history, page_from_rows, room_history, unread_counts};
    use crate::server::{
        auth::now_unix,
        core::{AppConfig, AppState, AuthContext},
        errors::ApiFailure,
        storage::{repository, seed_user, ChatPersistence},
    };

    fn row(id: &str) -> ChatMessage {
        ChatMessage::Room(RoomMessage {
            message_id: id.to_owned(),
            room_id: String::from("r"),
            sender: UserSummary {
                user_id: String::from("u"),
                username: String::from("u"),
                avatar_url: None,
            },
            body: Some(id.to_owned()),
            attachment: None,
            created_at_unix: 0,
        })
    }

    fn state_with_page_limit(limit: usize) -> AppState {
        let config = AppConfig {
            history_page_limit: limit,
            upload_root: std::env::temp_dir().join("parley-history-tests"),
            ..AppConfig::default()
        };
        AppState::new(&config).unwrap()
    }

    async fn user(state: &AppState, name: &str) -> AuthContext {
        let record = seed_user(state, name).await;
        AuthContext {
            user_id: record.user_id,
            username: record.username,
        }
    }

    fn text(body: &str) -> MessageContent {
        MessageContent::new(Some(body.to_owned()), None).unwrap()
    }

    async fn send_direct(state: &AppState, from: UserId, to: UserId, body: &str) {
        repository(state)
            .await
            .unwrap()
            .insert_direct_message(from, to, &text(body), now_unix())
            .await
            .unwrap();
    }

    #[test]
    fn full_page_drops_probe_row_and_points_cursor_at_oldest() {
        let page = page_from_rows(vec![row("5"), row("4"), row("3")], 2);
        let ids: Vec<_> = page.messages.iter().map(ChatMessage::message_id).collect();
        assert_eq!(ids, ["4", "5"]);
        assert!(page.has_more);
        assert_eq!(page.next_cursor.as_deref(), Some("4"));
    }

    #[test]
    fn short_page_has_no_cursor() {
        let page = page_from_rows(vec![row("2"), row("1")], 2);
        assert!(!page.has_more);
        assert_eq!(page.next_cursor, None);
        assert_eq!(page.messages.len(), 2);
    }

    #[tokio::test]
    async fn walking_cursors_returns_each_room_message_once_in_order() {
        let state = state_with_page_limit(3);
        let alice = user(&state, "alice").await;
        let repo = repository(&state).await.unwrap();
        let general = repo.find_room_by_name("general").await.unwrap().unwrap();
        repo.add_membership(alice.user_id, general.room_id)
            .await
            .unwrap();

        let total = 10;
        for index in 0..total {
            repo.insert_room_message(
                general.room_id,
                alice.user_id,
                &text(&format!("m{index}")),
                now_unix(),
            )
            .await
            .unwrap();
        }

        let mut pages = Vec::new();
        let mut cursor = None;
        loop {
            let page = room_history(&state, &alice, general.room_id, cursor)
                .await
                .unwrap();
            cursor = page
                .next_cursor
                .as_deref()
                .map(|value| value.try_into().unwrap());
            let done = !page.has_more;
            pages.push(page);
            if done {
                break;
            }
        }

        assert_eq!(pages.len(), 4);
        assert!(pages[..3].iter().all(|page| page.has_more));
        let bodies: Vec<String> = pages
            .iter()
            .rev()
            .flat_map(|page| page.messages.iter())
            .map(|message| message.body().unwrap_or_default().to_owned())
            .collect();
        let expected: Vec<String> = (0..total).map(|index| format!("m{index}")).collect();
        assert_eq!(bodies, expected);
    }

    #[tokio::test]
    async fn room_history_distinguishes_forbidden_from_missing() {
        let state = state_with_page_limit(5);
        let alice = user(&state, "alice").await;
        let general = repository(&state)
            .await
            .unwrap()
            .find_room_by_name("general")
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(
            room_history(&state, &alice, general.room_id, None).await,
            Err(ApiFailure::Forbidden)
        ));
        assert!(matches!(
            room_history(&state, &alice, parley_core::RoomId::new(), None).await,
            Err(ApiFailure::NotFound)
        ));
    }

    #[tokio::test]
    async fn opening_a_conversation_resets_only_that_senders_count() {
        let state = state_with_page_limit(50);
        let reader = user(&state, "reader").await;
        let x = user(&state, "sender_x").await;
        let y = user(&state, "sender_y").await;

        send_direct(&state, x.user_id, reader.user_id, "x1").await;
        send_direct(&state, x.user_id, reader.user_id, "x2").await;
        send_direct(&state, y.user_id, reader.user_id, "y1").await;

        let counts = |entries: Vec<crate::server::storage::UnreadCount>| {
            entries
                .into_iter()
                .map(|entry| (entry.sender_id, entry.count))
                .collect::<HashMap<_, _>>()
        };

        let before = counts(unread_counts(&state, &reader).await.unwrap());
        assert_eq!(before.get(&x.user_id), Some(&2));
        assert_eq!(before.get(&y.user_id), Some(&1));

        let page = direct_history(&state, &reader, x.user_id, None)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 2);
        assert!(page
            .messages
            .iter()
            .all(|message| matches!(message, ChatMessage::Direct(dm) if dm.read)));

        let after = counts(unread_counts(&state, &reader).await.unwrap());
        assert_eq!(after.get(&x.user_id), None);
        assert_eq!(after.get(&y.user_id), Some(&1));

        send_direct(&state, x.user_id, reader.user_id, "x3").await;
        let again = counts(unread_counts(&state, &reader).await.unwrap());
        assert_eq!(again.get(&x.user_id), Some(&1));
    }

    #[tokio::test]
    async fn direct_history_rejects_self_and_unknown_partner() {
        let state = state_with_page_limit(5);
        let alice = user(&state, "alice").await;
        assert!(matches!(
            direct_history(&state, &alice, alice.user_id, None).await,
            Err(ApiFailure::InvalidRequest)
        ));
        assert!(matches!(
            direct_history(&state, &alice, UserId::new(), None).await,
            Err(ApiFailure::NotFound)
        ));
    }
}
