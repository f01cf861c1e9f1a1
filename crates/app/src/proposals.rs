use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use cabinet_portal_core::pricing::{format_currency, proposal_total, summarize};
use cabinet_portal_core::status::{timeline as build_timeline, transition, TimelineEntry, TimelineInput};
use cabinet_portal_core::types::{
    CustomerInput, Id, ManufacturerVersion, NewNotification, NotificationPriority, Proposal,
    ProposalInput, ProposalKind,
};
use cabinet_portal_core::{GroupScope, Page, PageRequest, Permission, PricingContext, ProposalStatus};
use cabinet_portal_storage::{
    NewActivity, NewProposal, ProposalCounts, ProposalError, ProposalFilter, ProposalUpdate,
    StatusTransition,
};

use crate::auth::AuthUser;
use crate::events::PortalEvent;
use crate::notifications::deliver;
use crate::problem::ProblemResponse;
use crate::router::{non_empty, AppState};

const LATEST_DEFAULT: u32 = 5;
const LATEST_MAX: u32 = 20;

#[derive(Debug, Default, Deserialize)]
pub struct ProposalQuery {
    page: Option<String>,
    limit: Option<String>,
    status: Option<String>,
    kind: Option<String>,
    search: Option<String>,
}

impl ProposalQuery {
    fn filter(&self, forced_kind: Option<ProposalKind>) -> Result<ProposalFilter, ProblemResponse> {
        let status = non_empty(self.status.as_deref())
            .map(|raw| raw.parse::<ProposalStatus>())
            .transpose()?;
        let kind = match forced_kind {
            Some(kind) => Some(kind),
            None => non_empty(self.kind.as_deref())
                .map(|raw| {
                    ProposalKind::parse(raw).ok_or_else(|| {
                        ProblemResponse::bad_request("unknown_kind", format!("unknown kind '{raw}'"))
                    })
                })
                .transpose()?,
        };
        Ok(ProposalFilter {
            status,
            kind,
            search: non_empty(self.search.as_deref()).map(str::to_string),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LatestQuery {
    limit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusChange {
    #[serde(default)]
    status: String,
}

/// Lists proposals visible under `scope`. Shared with the contractor detail page.
pub(crate) async fn list_scoped(
    state: &AppState,
    scope: GroupScope,
    query: &ProposalQuery,
    forced_kind: Option<ProposalKind>,
) -> Result<Page<Proposal>, ProblemResponse> {
    let filter = query.filter(forced_kind)?;
    let request = PageRequest::from_query(
        query.page.as_deref(),
        query.limit.as_deref(),
        PageRequest::DEFAULT_LIMIT,
        PageRequest::MAX_LIMIT,
    );
    Ok(state.storage().proposals().list(scope, request, &filter).await?)
}

async fn load(state: &AppState, auth: &AuthUser, id: Id) -> Result<Proposal, ProblemResponse> {
    let proposal = state
        .storage()
        .proposals()
        .find(id)
        .await?
        .ok_or(ProposalError::NotFound)?;
    auth.require_access(proposal.owner_group_id)?;
    Ok(proposal)
}

/// Audit entries never fail the request that produced them.
async fn record_activity(
    state: &AppState,
    actor_id: Option<Id>,
    action: &str,
    proposal_id: Id,
    diff: Option<Value>,
) {
    let entry = NewActivity {
        actor_id,
        action,
        target_type: "proposal",
        target_id: Some(proposal_id),
        diff,
        created_at: state.now(),
    };
    if let Err(err) = state.storage().activity().append(entry).await {
        warn!(stage = "proposals", proposal_id, action, error = %err, "failed to record activity");
    }
}

/// Recomputes every version summary with the current manufacturer, group and tax settings.
/// Disabled manufacturers can only be priced by admins.
async fn price_versions(
    state: &AppState,
    auth: &AuthUser,
    owner_group_id: Option<Id>,
    input: &ProposalInput,
) -> Result<Vec<ManufacturerVersion>, ProblemResponse> {
    let storage = state.storage();
    let tax_rate_pct = storage.taxes().default_rate().await?;
    let group_multiplier = match owner_group_id {
        Some(group_id) => storage
            .groups()
            .find(group_id)
            .await?
            .map(|group| group.effective_multiplier())
            .unwrap_or(1.0),
        None => 1.0,
    };

    let mut versions = Vec::with_capacity(input.manufacturers_data.len());
    for version in &input.manufacturers_data {
        let manufacturer = storage
            .manufacturers()
            .find(version.manufacturer_id)
            .await?
            .filter(|manufacturer| manufacturer.enabled || auth.actor.is_admin())
            .ok_or_else(|| {
                ProblemResponse::bad_request(
                    "unknown_manufacturer",
                    format!("manufacturer {} does not exist", version.manufacturer_id),
                )
            })?;
        let ctx = PricingContext {
            manufacturer_multiplier: manufacturer.cost_multiplier,
            group_multiplier,
            showroom_multiplier: input.showroom_multiplier,
            tax_rate_pct,
            delivery_fee: manufacturer.delivery_fee,
        };
        let mut priced = version.clone();
        priced.summary = Some(summarize(version, &ctx)?);
        versions.push(priced);
    }
    Ok(versions)
}

/// Uses `customer_id` when given, otherwise finds or creates the inline customer by email
/// inside the owner group.
async fn resolve_customer(
    state: &AppState,
    auth: &AuthUser,
    owner_group_id: Option<Id>,
    input: &ProposalInput,
) -> Result<Option<Id>, ProblemResponse> {
    let customers = state.storage().customers();
    if let Some(customer_id) = input.customer_id {
        let customer = customers.find(customer_id).await?.ok_or_else(|| {
            ProblemResponse::bad_request("unknown_customer", "customer does not exist")
        })?;
        auth.require_access(customer.group_id)?;
        return Ok(Some(customer.id));
    }

    let Some(inline) = &input.customer else {
        return Ok(None);
    };
    if let Some(email) = non_empty(inline.email.as_deref()) {
        if let Some(existing) = customers.find_by_email(email, owner_group_id).await? {
            return Ok(Some(existing.id));
        }
    }
    let created = customers
        .create(
            &CustomerInput {
                name: inline.name.clone(),
                email: inline.email.clone(),
                mobile: inline.mobile.clone(),
                ..CustomerInput::default()
            },
            owner_group_id,
            Some(auth.user.id),
            state.now(),
        )
        .await?;
    info!(stage = "proposals", customer_id = created.id, "inline customer created");
    Ok(Some(created.id))
}

fn requested_status(input: &ProposalInput) -> Result<Option<ProposalStatus>, ProblemResponse> {
    match non_empty(input.status.as_deref()) {
        Some(raw) => Ok(Some(raw.parse::<ProposalStatus>()?)),
        None => Ok(None),
    }
}

/// Validates a requested status against the current one. Acceptance has its own path.
fn planned_transition(
    current: ProposalStatus,
    target: ProposalStatus,
) -> Result<Option<StatusTransition>, ProblemResponse> {
    if target == ProposalStatus::Accepted {
        return Err(ProblemResponse::bad_request(
            "invalid_status",
            "use the accept endpoint to accept a proposal",
        ));
    }
    Ok(transition(current, target)?.then_some(StatusTransition {
        from: current,
        to: target,
    }))
}

/// Applies a status change that is not an acceptance.
async fn apply_status(
    state: &AppState,
    auth: &AuthUser,
    proposal: Proposal,
    target: ProposalStatus,
) -> Result<Proposal, ProblemResponse> {
    if proposal.is_locked() {
        return Err(ProposalError::Locked.into());
    }
    let Some(change) = planned_transition(proposal.status, target)? else {
        return Ok(proposal);
    };

    let updated = state
        .storage()
        .proposals()
        .set_status(proposal.id, change, state.now())
        .await?;
    announce_status(state, auth, &updated, change).await;
    Ok(updated)
}

async fn announce_status(state: &AppState, auth: &AuthUser, updated: &Proposal, change: StatusTransition) {
    let StatusTransition { from, to } = change;
    counter!("proposal_transitions_total", "to" => to.as_str()).increment(1);
    state.events().publish(PortalEvent::ProposalStatusChanged {
        proposal_id: updated.id,
        owner_group_id: updated.owner_group_id,
        from,
        to,
        at: updated.updated_at,
    });
    record_activity(
        state,
        Some(auth.user.id),
        "proposal.status",
        updated.id,
        Some(json!({ "from": from, "to": to })),
    )
    .await;
    info!(stage = "proposals", proposal_id = updated.id, %from, %to, "proposal status changed");
}

/// Notifies admins (high) and the owner group's members (medium), once per proposal.
/// Lookup failures are logged; the acceptance itself already happened.
async fn notify_accepted(state: &AppState, auth: &AuthUser, proposal: &Proposal) {
    let users = state.storage().users();
    let admins: Vec<Id> = match users.admin_ids().await {
        Ok(ids) => ids.into_iter().filter(|id| *id != auth.user.id).collect(),
        Err(err) => {
            warn!(stage = "proposals", proposal_id = proposal.id, error = %err, "failed to load admin recipients");
            Vec::new()
        }
    };
    let members: Vec<Id> = match proposal.owner_group_id {
        Some(group_id) => match users.member_ids(group_id).await {
            Ok(ids) => ids.into_iter().filter(|id| *id != auth.user.id).collect(),
            Err(err) => {
                warn!(
                    stage = "proposals",
                    proposal_id = proposal.id,
                    group_id,
                    error = %err,
                    "failed to load group recipients"
                );
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    let label = proposal
        .title
        .as_deref()
        .map(str::to_string)
        .unwrap_or_else(|| format!("Proposal #{}", proposal.id));
    let dedupe_key = format!("proposal.accepted:{}", proposal.id);
    let mut notification = NewNotification {
        kind: "proposal.accepted".to_string(),
        title: "Proposal accepted".to_string(),
        message: format!(
            "{label} was accepted ({})",
            format_currency(proposal.grand_total_cents)
        ),
        payload: Some(json!({
            "proposal_id": proposal.id,
            "owner_group_id": proposal.owner_group_id,
            "grand_total_cents": proposal.grand_total_cents,
        })),
        priority: NotificationPriority::High,
        action_url: Some(format!("/proposals/{}", proposal.id)),
        created_by: Some(auth.user.id),
    };
    deliver(state, &admins, &notification, Some(&dedupe_key)).await;
    notification.priority = NotificationPriority::Medium;
    deliver(state, &members, &notification, Some(&dedupe_key)).await;
}

pub async fn list(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ProposalQuery>,
) -> Result<Json<Page<Proposal>>, ProblemResponse> {
    auth.require(Permission::ProposalsRead)?;
    Ok(Json(list_scoped(&state, auth.actor.scope(), &query, None).await?))
}

pub async fn orders(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ProposalQuery>,
) -> Result<Json<Page<Proposal>>, ProblemResponse> {
    auth.require(Permission::ProposalsRead)?;
    Ok(Json(
        list_scoped(&state, auth.actor.scope(), &query, Some(ProposalKind::Order)).await?,
    ))
}

pub async fn show(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<Json<Proposal>, ProblemResponse> {
    auth.require(Permission::ProposalsRead)?;
    Ok(Json(load(&state, &auth, id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(input): Json<ProposalInput>,
) -> Result<(StatusCode, Json<Proposal>), ProblemResponse> {
    auth.require(Permission::ProposalsCreate)?;
    input.validate()?;

    let status = requested_status(&input)?.unwrap_or(ProposalStatus::Draft);
    if !matches!(status, ProposalStatus::Draft | ProposalStatus::Sent) {
        return Err(ProblemResponse::bad_request(
            "invalid_status",
            format!("new proposals cannot start as {status}"),
        ));
    }

    let owner_group_id = auth.actor.scope().owner_for_new();
    let customer_id = resolve_customer(&state, &auth, owner_group_id, &input).await?;
    let versions = price_versions(&state, &auth, owner_group_id, &input).await?;
    let now = state.now();

    let proposal = state
        .storage()
        .proposals()
        .create(&NewProposal {
            customer_id,
            owner_group_id,
            created_by: Some(auth.user.id),
            title: input.title.clone(),
            description: input.description.clone(),
            designer: input.designer.clone(),
            sales_rep: input.sales_rep.clone(),
            lead_source: input.lead_source.clone(),
            status,
            date: input.date,
            follow_up_dates: input.follow_up_dates.clone(),
            grand_total_cents: proposal_total(&versions),
            manufacturers_data: versions,
            sent_at: (status == ProposalStatus::Sent).then_some(now),
            expires_at: input.expires_at,
            created_at: now,
        })
        .await?;

    counter!("proposals_saved_total", "op" => "create").increment(1);
    record_activity(&state, Some(auth.user.id), "proposal.created", proposal.id, None).await;
    info!(
        stage = "proposals",
        proposal_id = proposal.id,
        owner_group_id = ?proposal.owner_group_id,
        total = proposal.grand_total_cents,
        "proposal created"
    );
    Ok((StatusCode::CREATED, Json(proposal)))
}

pub async fn update(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    Json(input): Json<ProposalInput>,
) -> Result<Json<Proposal>, ProblemResponse> {
    auth.require(Permission::ProposalsUpdate)?;
    let existing = load(&state, &auth, id).await?;
    if existing.is_locked() {
        return Err(ProposalError::Locked.into());
    }
    input.validate()?;
    let status_change = match requested_status(&input)? {
        Some(target) => planned_transition(existing.status, target)?,
        None => None,
    };

    let customer_id = resolve_customer(&state, &auth, existing.owner_group_id, &input).await?;
    let versions = price_versions(&state, &auth, existing.owner_group_id, &input).await?;
    let proposal = state
        .storage()
        .proposals()
        .update(
            id,
            &ProposalUpdate {
                customer_id,
                title: input.title.clone(),
                description: input.description.clone(),
                designer: input.designer.clone(),
                sales_rep: input.sales_rep.clone(),
                lead_source: input.lead_source.clone(),
                date: input.date,
                follow_up_dates: input.follow_up_dates.clone(),
                grand_total_cents: proposal_total(&versions),
                manufacturers_data: versions,
                expires_at: input.expires_at,
            },
            status_change,
            state.now(),
        )
        .await?;
    counter!("proposals_saved_total", "op" => "update").increment(1);
    record_activity(&state, Some(auth.user.id), "proposal.updated", id, None).await;
    if let Some(change) = status_change {
        announce_status(&state, &auth, &proposal, change).await;
    }
    Ok(Json(proposal))
}

pub async fn remove(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<StatusCode, ProblemResponse> {
    auth.require(Permission::ProposalsDelete)?;
    load(&state, &auth, id).await?;
    state.storage().proposals().soft_delete(id, state.now()).await?;
    counter!("proposals_saved_total", "op" => "delete").increment(1);
    record_activity(&state, Some(auth.user.id), "proposal.deleted", id, None).await;
    info!(stage = "proposals", proposal_id = id, "proposal deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn change_status(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    Json(body): Json<StatusChange>,
) -> Result<Json<Proposal>, ProblemResponse> {
    auth.require(Permission::ProposalsUpdate)?;
    let target: ProposalStatus = body.status.parse()?;
    let proposal = load(&state, &auth, id).await?;
    let proposal = if target == ProposalStatus::Accepted {
        auth.require(Permission::ProposalsAccept)?;
        accept_proposal(&state, &auth, proposal).await?
    } else {
        apply_status(&state, &auth, proposal, target).await?
    };
    Ok(Json(proposal))
}

pub async fn accept(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<Json<Proposal>, ProblemResponse> {
    auth.require(Permission::ProposalsAccept)?;
    let proposal = load(&state, &auth, id).await?;
    Ok(Json(accept_proposal(&state, &auth, proposal).await?))
}

async fn accept_proposal(
    state: &AppState,
    auth: &AuthUser,
    proposal: Proposal,
) -> Result<Proposal, ProblemResponse> {
    if proposal.is_locked() {
        return Err(ProposalError::Locked.into());
    }
    let from = proposal.status;
    transition(from, ProposalStatus::Accepted)?;

    let accepted = state
        .storage()
        .proposals()
        .accept(proposal.id, from, Some(auth.user.id), state.now())
        .await?;
    let at = accepted.accepted_at.unwrap_or(accepted.updated_at);

    counter!("proposal_transitions_total", "to" => ProposalStatus::Accepted.as_str()).increment(1);
    record_activity(
        state,
        Some(auth.user.id),
        "proposal.accepted",
        accepted.id,
        Some(json!({ "from": from, "grand_total_cents": accepted.grand_total_cents })),
    )
    .await;
    notify_accepted(state, auth, &accepted).await;
    state.events().publish(PortalEvent::ProposalAccepted {
        proposal_id: accepted.id,
        owner_group_id: accepted.owner_group_id,
        accepted_by: accepted.accepted_by,
        at,
    });
    info!(stage = "proposals", proposal_id = accepted.id, user_id = auth.user.id, "proposal accepted");
    Ok(accepted)
}

pub async fn timeline(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<Json<Vec<TimelineEntry>>, ProblemResponse> {
    auth.require(Permission::ProposalsRead)?;
    let proposal = load(&state, &auth, id).await?;
    Ok(Json(build_timeline(TimelineInput {
        status: proposal.status,
        created_at: proposal.created_at,
        updated_at: proposal.updated_at,
        sent_at: proposal.sent_at,
        accepted_at: proposal.accepted_at,
    })))
}

pub async fn dashboard_counts(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<ProposalCounts>, ProblemResponse> {
    auth.require(Permission::ProposalsRead)?;
    let counts = state.storage().proposals().counts(auth.actor.scope()).await?;
    Ok(Json(counts))
}

pub async fn latest(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<LatestQuery>,
) -> Result<Json<Vec<Proposal>>, ProblemResponse> {
    auth.require(Permission::ProposalsRead)?;
    let limit = PageRequest::from_query(None, query.limit.as_deref(), LATEST_DEFAULT, LATEST_MAX).limit;
    let proposals = state
        .storage()
        .proposals()
        .latest(auth.actor.scope(), limit)
        .await?;
    Ok(Json(proposals))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::{json, Value};

    use cabinet_portal_core::types::{GroupInput, GroupType, ManufacturerInput, Role, TaxInput};
    use cabinet_portal_core::{PageRequest, ProposalStatus};
    use cabinet_portal_storage::NotificationFilter;

    use super::accept_proposal;
    use crate::auth::authenticate;
    use crate::events::PortalEvent;
    use crate::router::test_support::*;
    use crate::router::AppState;

    async fn seed_manufacturer(state: &AppState, delivery_fee: f64) -> i64 {
        state
            .storage()
            .manufacturers()
            .create(
                &ManufacturerInput {
                    name: "Shaker Works".to_string(),
                    delivery_fee,
                    ..ManufacturerInput::default()
                },
                state.now(),
            )
            .await
            .expect("manufacturer")
            .id
    }

    fn proposal_body(manufacturer_id: i64, email: &str) -> Value {
        json!({
            "title": "Kitchen remodel",
            "customer": { "name": "Pat Buyer", "email": email },
            "manufacturers_data": [{
                "manufacturer_id": manufacturer_id,
                "version_name": "Option A",
                "items": [{
                    "code": "B12",
                    "qty": 2,
                    "price": 100.0,
                    "assembly_cost": { "type": "flat", "price": 10.0 }
                }]
            }]
        })
    }

    async fn notifications_for(state: &AppState, user_id: i64) -> Vec<Value> {
        let page = state
            .storage()
            .notifications()
            .list(user_id, PageRequest::default(), &NotificationFilter::default())
            .await
            .expect("notifications");
        page.data
            .into_iter()
            .map(|notification| serde_json::to_value(notification).expect("json"))
            .collect()
    }

    #[tokio::test]
    async fn create_prices_versions_and_reuses_inline_customer() {
        let (state, _dir) = setup_state().await;
        let (_, admin) = seed_user(&state, "admin@example.com", Role::Admin, None).await;
        let manufacturer_id = seed_manufacturer(&state, 50.0).await;
        state
            .storage()
            .taxes()
            .create(
                &TaxInput {
                    label: "State".to_string(),
                    value: 10.0,
                    is_default: true,
                },
                state.now(),
            )
            .await
            .expect("tax");
        let app = router(&state);

        let created = send(
            &app,
            Method::POST,
            "/api/proposals",
            Some(&admin),
            Some(proposal_body(manufacturer_id, "pat@example.com")),
        )
        .await;
        assert_eq!(created.status, StatusCode::CREATED);
        assert_eq!(created.body["status"], "draft");
        let summary = &created.body["manufacturers_data"][0]["summary"];
        assert_eq!(summary["parts_cents"], 20000);
        assert_eq!(summary["assembly_cents"], 2000);
        assert_eq!(summary["delivery_cents"], 5000);
        assert_eq!(summary["tax_cents"], 2700);
        assert_eq!(created.body["grand_total_cents"], 29700);

        let again = send(
            &app,
            Method::POST,
            "/api/proposals",
            Some(&admin),
            Some(proposal_body(manufacturer_id, "PAT@example.com")),
        )
        .await;
        assert_eq!(again.status, StatusCode::CREATED);
        assert_eq!(again.body["customer_id"], created.body["customer_id"]);
    }

    #[tokio::test]
    async fn group_multiplier_applies_to_contractor_proposals() {
        let (state, _dir) = setup_state().await;
        let group = state
            .storage()
            .groups()
            .create(
                &GroupInput {
                    name: "Premium".to_string(),
                    group_type: GroupType::Contractor,
                    modules: all_modules(),
                    multiplier: Some(1.5),
                    multiplier_enabled: true,
                },
                state.now(),
            )
            .await
            .expect("group");
        let (_, token) = seed_user(&state, "c@premium.test", Role::Contractor, Some(group.id)).await;
        let manufacturer_id = seed_manufacturer(&state, 0.0).await;
        let app = router(&state);

        let created = send(
            &app,
            Method::POST,
            "/api/proposals",
            Some(&token),
            Some(json!({
                "customer": { "name": "Walk-in" },
                "manufacturers_data": [{
                    "manufacturer_id": manufacturer_id,
                    "items": [{ "code": "W3030", "price": 100.0 }]
                }]
            })),
        )
        .await;
        assert_eq!(created.status, StatusCode::CREATED);
        assert_eq!(created.body["owner_group_id"], group.id);
        assert_eq!(created.body["grand_total_cents"], 15000);
    }

    #[tokio::test]
    async fn status_changes_follow_transition_rules() {
        let (state, _dir) = setup_state().await;
        let (_, admin) = seed_user(&state, "admin@example.com", Role::Admin, None).await;
        let manufacturer_id = seed_manufacturer(&state, 0.0).await;
        let app = router(&state);
        let created = send(
            &app,
            Method::POST,
            "/api/proposals",
            Some(&admin),
            Some(proposal_body(manufacturer_id, "pat@example.com")),
        )
        .await;
        let id = created.body["id"].as_i64().expect("id");
        let uri = format!("/api/proposals/{id}/status");

        let expired = send(&app, Method::POST, &uri, Some(&admin), Some(json!({ "status": "expired" }))).await;
        assert_eq!(expired.status, StatusCode::CONFLICT);

        let unknown = send(&app, Method::POST, &uri, Some(&admin), Some(json!({ "status": "archived" }))).await;
        assert_eq!(unknown.status, StatusCode::BAD_REQUEST);

        let sent = send(&app, Method::POST, &uri, Some(&admin), Some(json!({ "status": "Follow up 1" }))).await;
        assert_eq!(sent.status, StatusCode::OK);
        assert_eq!(sent.body["status"], "sent");
        assert!(sent.body["sent_at"].is_string());

        let timeline = send(
            &app,
            Method::GET,
            &format!("/api/proposals/{id}/timeline"),
            Some(&admin),
            None,
        )
        .await;
        let steps: Vec<&str> = timeline
            .body
            .as_array()
            .expect("timeline")
            .iter()
            .filter_map(|entry| entry["status"].as_str())
            .collect();
        assert_eq!(steps, vec!["created", "sent"]);

        let counts = send(&app, Method::GET, "/api/dashboard/counts", Some(&admin), None).await;
        assert_eq!(counts.body["sent"], 1);
        assert_eq!(counts.body["total"], 1);
    }

    #[tokio::test]
    async fn accept_locks_proposal_and_notifies_once() {
        let (state, _dir) = setup_state().await;
        let group = seed_group(&state, "Acme", all_modules()).await;
        let (member, member_token) =
            seed_user(&state, "m@acme.test", Role::Contractor, Some(group)).await;
        let (_, acceptor) = seed_user(&state, "admin@example.com", Role::Admin, None).await;
        let (watcher, _) = seed_user(&state, "boss@example.com", Role::SuperAdmin, None).await;
        let manufacturer_id = seed_manufacturer(&state, 0.0).await;
        let app = router(&state);

        let created = send(
            &app,
            Method::POST,
            "/api/proposals",
            Some(&member_token),
            Some(proposal_body(manufacturer_id, "pat@example.com")),
        )
        .await;
        let id = created.body["id"].as_i64().expect("id");

        let accepted = send(
            &app,
            Method::POST,
            &format!("/api/proposals/{id}/accept"),
            Some(&acceptor),
            None,
        )
        .await;
        assert_eq!(accepted.status, StatusCode::OK);
        assert_eq!(accepted.body["status"], "accepted");
        assert_eq!(accepted.body["kind"], "order");

        let again = send(
            &app,
            Method::POST,
            &format!("/api/proposals/{id}/accept"),
            Some(&acceptor),
            None,
        )
        .await;
        assert_eq!(again.status, StatusCode::CONFLICT);

        let edit = send(
            &app,
            Method::PUT,
            &format!("/api/proposals/{id}"),
            Some(&member_token),
            Some(proposal_body(manufacturer_id, "pat@example.com")),
        )
        .await;
        assert_eq!(edit.status, StatusCode::CONFLICT);

        let admin_notes = notifications_for(&state, watcher.id).await;
        assert_eq!(admin_notes.len(), 1);
        assert_eq!(admin_notes[0]["priority"], "high");
        assert_eq!(admin_notes[0]["type"], "proposal.accepted");
        let member_notes = notifications_for(&state, member.id).await;
        assert_eq!(member_notes.len(), 1);
        assert_eq!(member_notes[0]["priority"], "medium");

        let orders = send(&app, Method::GET, "/api/orders", Some(&member_token), None).await;
        assert_eq!(orders.body["pagination"]["total"], 1);

        let activity = state
            .storage()
            .activity()
            .list_for_target("proposal", id)
            .await
            .expect("activity");
        assert!(activity.iter().any(|entry| entry.action == "proposal.accepted"));
    }

    #[tokio::test]
    async fn refused_status_in_put_leaves_proposal_untouched() {
        let (state, _dir) = setup_state().await;
        let (_, admin) = seed_user(&state, "admin@example.com", Role::Admin, None).await;
        let manufacturer_id = seed_manufacturer(&state, 0.0).await;
        let app = router(&state);
        let created = send(
            &app,
            Method::POST,
            "/api/proposals",
            Some(&admin),
            Some(proposal_body(manufacturer_id, "pat@example.com")),
        )
        .await;
        let id = created.body["id"].as_i64().expect("id");
        let uri = format!("/api/proposals/{id}");

        let mut body = proposal_body(manufacturer_id, "pat@example.com");
        body["title"] = json!("Changed");
        body["status"] = json!("expired");
        let conflict = send(&app, Method::PUT, &uri, Some(&admin), Some(body.clone())).await;
        assert_eq!(conflict.status, StatusCode::CONFLICT);

        body["status"] = json!("accepted");
        let invalid = send(&app, Method::PUT, &uri, Some(&admin), Some(body.clone())).await;
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);

        let current = send(&app, Method::GET, &uri, Some(&admin), None).await;
        assert_eq!(current.body["title"], "Kitchen remodel");
        assert_eq!(current.body["status"], "draft");
        let activity = state
            .storage()
            .activity()
            .list_for_target("proposal", id)
            .await
            .expect("activity");
        assert!(activity.iter().all(|entry| entry.action != "proposal.updated"));

        let mut events = state.events().subscribe();
        body["status"] = json!("sent");
        let sent = send(&app, Method::PUT, &uri, Some(&admin), Some(body)).await;
        assert_eq!(sent.status, StatusCode::OK);
        assert_eq!(sent.body["title"], "Changed");
        assert_eq!(sent.body["status"], "sent");
        let mut published = Vec::new();
        while let Ok(event) = events.try_recv() {
            published.push(event);
        }
        assert!(published.iter().any(|event| matches!(
            event,
            PortalEvent::ProposalStatusChanged {
                from: ProposalStatus::Draft,
                to: ProposalStatus::Sent,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn acceptance_follows_transition_table() {
        let (state, _dir) = setup_state().await;
        let (_, admin) = seed_user(&state, "admin@example.com", Role::Admin, None).await;
        let manufacturer_id = seed_manufacturer(&state, 0.0).await;
        let app = router(&state);

        let mut ids = Vec::new();
        for _ in 0..2 {
            let created = send(
                &app,
                Method::POST,
                "/api/proposals",
                Some(&admin),
                Some(proposal_body(manufacturer_id, "pat@example.com")),
            )
            .await;
            ids.push(created.body["id"].as_i64().expect("id"));
        }

        let rejected = send(
            &app,
            Method::POST,
            &format!("/api/proposals/{}/status", ids[0]),
            Some(&admin),
            Some(json!({ "status": "rejected" })),
        )
        .await;
        assert_eq!(rejected.status, StatusCode::OK);
        for uri in [
            format!("/api/proposals/{}/accept", ids[0]),
            format!("/api/proposals/{}/status", ids[0]),
        ] {
            let refused = send(
                &app,
                Method::POST,
                &uri,
                Some(&admin),
                Some(json!({ "status": "accepted" })),
            )
            .await;
            assert_eq!(refused.status, StatusCode::CONFLICT);
        }

        let direct = send(
            &app,
            Method::POST,
            &format!("/api/proposals/{}/status", ids[1]),
            Some(&admin),
            Some(json!({ "status": "accepted" })),
        )
        .await;
        assert_eq!(direct.status, StatusCode::OK);
        assert_eq!(direct.body["status"], "accepted");
        assert_eq!(direct.body["kind"], "order");
    }

    #[tokio::test]
    async fn acceptance_survives_recipient_lookup_failure() {
        let (state, _dir) = setup_state().await;
        let (_, token) = seed_user(&state, "admin@example.com", Role::Admin, None).await;
        let auth = authenticate(&state, &token).await.expect("auth");
        let manufacturer_id = seed_manufacturer(&state, 0.0).await;
        let app = router(&state);
        let created = send(
            &app,
            Method::POST,
            "/api/proposals",
            Some(&token),
            Some(proposal_body(manufacturer_id, "pat@example.com")),
        )
        .await;
        let id = created.body["id"].as_i64().expect("id");
        let proposal = state
            .storage()
            .proposals()
            .find(id)
            .await
            .expect("find")
            .expect("exists");

        sqlx::query("ALTER TABLE users RENAME TO users_archived")
            .execute(state.storage().pool())
            .await
            .expect("rename");
        let mut events = state.events().subscribe();

        let accepted = accept_proposal(&state, &auth, proposal).await.expect("accepted");
        assert_eq!(accepted.status, ProposalStatus::Accepted);
        let mut published = Vec::new();
        while let Ok(event) = events.try_recv() {
            published.push(event);
        }
        assert!(published.iter().any(|event| matches!(
            event,
            PortalEvent::ProposalAccepted { proposal_id, .. } if *proposal_id == id
        )));
    }

    #[tokio::test]
    async fn disabled_manufacturers_are_priced_for_admins_only() {
        let (state, _dir) = setup_state().await;
        let (_, admin) = seed_user(&state, "admin@example.com", Role::Admin, None).await;
        let (_, member) = seed_user(&state, "member@example.com", Role::User, None).await;
        let manufacturer_id = seed_manufacturer(&state, 0.0).await;
        state
            .storage()
            .manufacturers()
            .set_enabled(manufacturer_id, false, state.now())
            .await
            .expect("disable");
        let app = router(&state);

        let refused = send(
            &app,
            Method::POST,
            "/api/proposals",
            Some(&member),
            Some(proposal_body(manufacturer_id, "pat@example.com")),
        )
        .await;
        assert_eq!(refused.status, StatusCode::BAD_REQUEST);
        assert_eq!(refused.body["type"], "unknown_manufacturer");

        let allowed = send(
            &app,
            Method::POST,
            "/api/proposals",
            Some(&admin),
            Some(proposal_body(manufacturer_id, "pat@example.com")),
        )
        .await;
        assert_eq!(allowed.status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn other_groups_cannot_read_proposals() {
        let (state, _dir) = setup_state().await;
        let acme = seed_group(&state, "Acme", all_modules()).await;
        let globex = seed_group(&state, "Globex", all_modules()).await;
        let (_, acme_token) = seed_user(&state, "a@acme.test", Role::Contractor, Some(acme)).await;
        let (_, globex_token) =
            seed_user(&state, "g@globex.test", Role::Contractor, Some(globex)).await;
        let manufacturer_id = seed_manufacturer(&state, 0.0).await;
        let app = router(&state);

        let created = send(
            &app,
            Method::POST,
            "/api/proposals",
            Some(&acme_token),
            Some(proposal_body(manufacturer_id, "pat@example.com")),
        )
        .await;
        let id = created.body["id"].as_i64().expect("id");

        let foreign = send(&app, Method::GET, &format!("/api/proposals/{id}"), Some(&globex_token), None).await;
        assert_eq!(foreign.status, StatusCode::FORBIDDEN);
        let listed = send(&app, Method::GET, "/api/proposals", Some(&globex_token), None).await;
        assert_eq!(listed.body["pagination"]["total"], 0);
        let latest = send(
            &app,
            Method::GET,
            "/api/dashboard/latest-proposals",
            Some(&acme_token),
            None,
        )
        .await;
        assert_eq!(latest.body.as_array().expect("latest").len(), 1);
    }

    #[tokio::test]
    async fn missing_customer_fails_validation() {
        let (state, _dir) = setup_state().await;
        let (_, admin) = seed_user(&state, "admin@example.com", Role::Admin, None).await;
        let app = router(&state);

        let response = send(&app, Method::POST, "/api/proposals", Some(&admin), Some(json!({}))).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert!(response.body["errors"]["customer_id"].is_string());
    }
}
