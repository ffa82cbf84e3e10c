use async_graphql::{Context, EmptyMutation, EmptySubscription, InputObject, Object, Schema};
use chrono::Utc;

use crate::domain::types::*;
use crate::domain::Services;

use super::rest::parse_date;

pub type WardenSchema = Schema<QueryRoot, EmptyMutation, EmptySubscription>;

fn gql_err(e: crate::error::Error) -> async_graphql::Error {
    async_graphql::Error::new(e.to_string())
}

/// Audit log filter. Dates accept RFC 3339 or `YYYY-MM-DD`.
#[derive(InputObject, Default)]
pub struct LogFilterInput {
    pub vmid: Option<u32>,
    pub resource_name: Option<String>,
    pub node: Option<String>,
    pub action: Option<Action>,
    pub trigger_type: Option<TriggerType>,
    pub status: Option<LogStatus>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl LogFilterInput {
    fn into_filter(self) -> crate::error::Result<LogFilter> {
        Ok(LogFilter {
            vmid: self.vmid,
            resource_name: self.resource_name,
            node: self.node,
            action: self.action,
            trigger_type: self.trigger_type,
            status: self.status,
            start_date: self.start_date.map(|s| parse_date(&s, false)).transpose()?,
            end_date: self.end_date.map(|s| parse_date(&s, true)).transpose()?,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    async fn status(&self, ctx: &Context<'_>) -> async_graphql::Result<SystemStatus> {
        let svc = ctx.data::<Services>()?;
        svc.status.status(Utc::now()).map_err(gql_err)
    }

    async fn nodes(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<Node>> {
        let svc = ctx.data::<Services>()?;
        svc.registry.list_nodes().map_err(gql_err)
    }

    async fn resources(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<Resource>> {
        let svc = ctx.data::<Services>()?;
        svc.registry.list_resources().map_err(gql_err)
    }

    /// Services deploys installed into a resource, newest first.
    async fn services(
        &self,
        ctx: &Context<'_>,
        vmid: u32,
        node: Option<String>,
    ) -> async_graphql::Result<Vec<InstalledService>> {
        let svc = ctx.data::<Services>()?;
        svc.registry
            .services_for(vmid, node.as_deref())
            .map_err(gql_err)
    }

    /// Whitelist entries in creation order.
    async fn whitelist(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<WhitelistEntry>> {
        let svc = ctx.data::<Services>()?;
        svc.whitelist.list().map_err(gql_err)
    }

    /// Audit log, newest first.
    async fn logs(
        &self,
        ctx: &Context<'_>,
        filter: Option<LogFilterInput>,
    ) -> async_graphql::Result<Vec<RestartLogEntry>> {
        let svc = ctx.data::<Services>()?;
        let filter = filter.unwrap_or_default().into_filter().map_err(gql_err)?;
        svc.audit.query(&filter).map_err(gql_err)
    }
}

pub fn build_schema(services: Services) -> WardenSchema {
    Schema::build(QueryRoot, EmptyMutation, EmptySubscription)
        .data(services)
        .finish()
}
