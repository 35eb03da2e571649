use super::*;
use crate::config::BackendTimeouts;

fn config(access_token: Option<&str>) -> BackendConfig {
    BackendConfig {
        url: "https://demo.supabase.co".into(),
        anon_key: "anon".into(),
        access_token: access_token.map(str::to_owned),
        timeouts: BackendTimeouts { request_secs: 5, connect_secs: 2 },
        heartbeat_secs: 25,
    }
}

// =============================================================================
// table_url / query_pairs
// =============================================================================

#[test]
fn table_url_joins_rest_path() {
    assert_eq!(table_url("https://demo.supabase.co/", "group_messages"), "https://demo.supabase.co/rest/v1/group_messages");
}

#[test]
fn query_pairs_select_all_by_default() {
    assert_eq!(query_pairs(&Filter::new(), None), vec![("select".to_owned(), "*".to_owned())]);
}

#[test]
fn query_pairs_encode_filter_and_order() {
    let pairs = query_pairs(&Filter::eq("group_id", "g1").and_eq("user_id", "u1"), Some(&Order::asc("created_at")));
    assert_eq!(
        pairs,
        vec![
            ("select".to_owned(), "*".to_owned()),
            ("group_id".to_owned(), "eq.g1".to_owned()),
            ("user_id".to_owned(), "eq.u1".to_owned()),
            ("order".to_owned(), "created_at.asc".to_owned()),
        ]
    );
}

#[test]
fn query_pairs_descending_order() {
    let pairs = query_pairs(&Filter::new(), Some(&Order::desc("created_at")));
    assert_eq!(pairs.last(), Some(&("order".to_owned(), "created_at.desc".to_owned())));
}

// =============================================================================
// parse_rows
// =============================================================================

#[test]
fn parse_rows_reads_array_of_objects() {
    let rows = parse_rows(r#"[{"id":"m1"},{"id":"m2"}]"#).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["id"], "m2");
}

#[test]
fn parse_rows_accepts_single_object() {
    let rows = parse_rows(r#"{"id":"m1"}"#).unwrap();
    assert_eq!(rows.len(), 1);
}

#[test]
fn parse_rows_rejects_scalars_and_garbage() {
    assert!(matches!(parse_rows("[1]"), Err(BackendError::Decode(_))));
    assert!(matches!(parse_rows("42"), Err(BackendError::Decode(_))));
    assert!(matches!(parse_rows("not json"), Err(BackendError::Decode(_))));
}

// =============================================================================
// parse_auth_user
// =============================================================================

#[test]
fn parse_auth_user_reads_metadata_full_name() {
    let user = parse_auth_user(r#"{"id":"u1","email":"ann@example.com","user_metadata":{"full_name":"Ann Lee"}}"#)
        .unwrap();
    assert_eq!(user.id, "u1");
    assert_eq!(user.email.as_deref(), Some("ann@example.com"));
    assert_eq!(user.full_name.as_deref(), Some("Ann Lee"));
}

#[test]
fn parse_auth_user_tolerates_missing_metadata() {
    let user = parse_auth_user(r#"{"id":"u1","email":""}"#).unwrap();
    assert_eq!(user.email, None);
    assert_eq!(user.full_name, None);
}

#[test]
fn parse_auth_user_requires_id() {
    assert!(parse_auth_user(r#"{"email":"x@y.z"}"#).is_err());
}

// =============================================================================
// RestClient
// =============================================================================

#[test]
fn client_uses_access_token_as_bearer_when_present() {
    let client = RestClient::new(&config(Some("jwt"))).unwrap();
    assert_eq!(client.bearer(), "jwt");
}

#[test]
fn client_falls_back_to_anon_key_bearer() {
    let client = RestClient::new(&config(None)).unwrap();
    assert_eq!(client.bearer(), "anon");
}

#[tokio::test]
async fn current_user_without_token_is_signed_out() {
    let client = RestClient::new(&config(None)).unwrap();
    assert_eq!(client.current_user().await.unwrap(), None);
}
