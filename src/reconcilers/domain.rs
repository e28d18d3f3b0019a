//! Domain reconciler: resolves DNS, matches the TXT verification token,
//! and marks a domain verified.

use anyhow::Result;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::INGRESS_IP;
use crate::scheduler::{Handler, ReconcileOutcome};

#[derive(sqlx::FromRow)]
struct DomainRow {
    id: Uuid,
    name: String,
    txt_verification_required: bool,
}

pub fn make_handler(pool: PgPool) -> Handler {
    let resolver = Arc::new(TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()));
    Arc::new(move |id: Uuid| {
        let pool = pool.clone();
        let resolver = resolver.clone();
        Box::pin(async move { reconcile(&pool, &resolver, id).await })
    })
}

async fn reconcile(pool: &PgPool, resolver: &TokioAsyncResolver, id: Uuid) -> Result<ReconcileOutcome> {
    let Some(domain): Option<DomainRow> = sqlx::query_as(
        "SELECT id, name, txt_verification_required FROM domains
         WHERE id = $1 AND verified_at IS NULL AND deleted_at IS NULL",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    else {
        return Ok(ReconcileOutcome::Done);
    };

    let resolved = tokio::time::timeout(Duration::from_secs(10), resolver.ipv4_lookup(&domain.name)).await;
    let matches_ingress = match resolved {
        Ok(Ok(answer)) => answer.iter().any(|ip| ip.0.to_string() == *INGRESS_IP),
        _ => false,
    };
    if !matches_ingress {
        return Ok(ReconcileOutcome::Requeue(Duration::from_secs(300)));
    }

    if domain.txt_verification_required {
        let txt_name = format!("_zeitwork.{}", domain.name);
        let expected = crate::ids::encode(domain.id);
        let resolved = tokio::time::timeout(Duration::from_secs(10), resolver.txt_lookup(&txt_name)).await;
        let found = match resolved {
            Ok(Ok(answer)) => answer.iter().any(|txt| txt.to_string() == expected),
            _ => false,
        };
        if !found {
            return Ok(ReconcileOutcome::Requeue(Duration::from_secs(300)));
        }
    }

    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE domains SET deleted_at = now(), updated_at = now()
         WHERE name = $1 AND id != $2 AND deleted_at IS NULL",
    )
    .bind(&domain.name)
    .bind(domain.id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("UPDATE domains SET verified_at = now(), updated_at = now() WHERE id = $1")
        .bind(domain.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(ReconcileOutcome::Done)
}
