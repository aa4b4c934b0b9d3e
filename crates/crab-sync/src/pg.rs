//! Postgres-backed [`RecordStore`].

use async_trait::async_trait;
use crab_core::store::StoreResult;
use crab_core::{
    Address, AddressFields, City, CrabStatus, NewCity, NewStreet, RecordStore, StoreError, Street,
};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const RUN_LOCK_KEY: i64 = 0x4352_4142_5359_4e43;

pub struct PgRecordStore {
    pool: PgPool,
    lock_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_conn: Mutex::new(None),
        }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(StoreError::backend)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StoreError::backend)
    }
}

fn status_from_code(code: i16) -> StoreResult<CrabStatus> {
    CrabStatus::try_from(code).map_err(|err| StoreError::InvalidRow(err.to_string()))
}

fn status_from_row(row: &PgRow) -> StoreResult<CrabStatus> {
    let code: i16 = row.try_get("status").map_err(StoreError::backend)?;
    status_from_code(code)
}

fn street_from_row(row: &PgRow) -> StoreResult<Street> {
    Ok(Street {
        id: row.try_get("id").map_err(StoreError::backend)?,
        fields: NewStreet {
            name: row.try_get("name").map_err(StoreError::backend)?,
            crab_id: row.try_get("crab_id").map_err(StoreError::backend)?,
            city_id: row.try_get("city_id").map_err(StoreError::backend)?,
            status: status_from_row(row)?,
        },
    })
}

fn address_from_row(row: &PgRow) -> StoreResult<Address> {
    Ok(Address {
        id: row.try_get("id").map_err(StoreError::backend)?,
        fields: AddressFields {
            crab_id: row.try_get("crab_id").map_err(StoreError::backend)?,
            street_id: row.try_get("street_id").map_err(StoreError::backend)?,
            house_number: row.try_get("house_number").map_err(StoreError::backend)?,
            apartment_number: row.try_get("apartment_number").map_err(StoreError::backend)?,
            sub_number: row.try_get("sub_number").map_err(StoreError::backend)?,
            status: status_from_row(row)?,
            geom: row.try_get("geom").map_err(StoreError::backend)?,
        },
    })
}

fn insert_error(entity: &'static str, crab_id: &str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate {
            entity,
            crab_id: crab_id.to_string(),
        },
        _ => StoreError::backend(err),
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn load_cities(&self) -> StoreResult<Vec<City>> {
        let rows = sqlx::query("SELECT id, name FROM crab_city ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.iter()
            .map(|row| {
                Ok(City {
                    id: row.try_get("id").map_err(StoreError::backend)?,
                    name: row.try_get("name").map_err(StoreError::backend)?,
                })
            })
            .collect()
    }

    async fn load_streets(&self) -> StoreResult<Vec<Street>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, crab_id, city_id, status
              FROM crab_street
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        rows.iter().map(street_from_row).collect()
    }

    async fn load_addresses(&self) -> StoreResult<Vec<Address>> {
        let rows = sqlx::query(
            r#"
            SELECT id, crab_id, street_id, house_number, apartment_number,
                   sub_number, status, geom
              FROM crab_address
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        rows.iter().map(address_from_row).collect()
    }

    async fn insert_city(&self, city: &NewCity) -> StoreResult<City> {
        let id: i64 = sqlx::query_scalar("INSERT INTO crab_city (name) VALUES ($1) RETURNING id")
            .bind(&city.name)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        Ok(City {
            id,
            name: city.name.clone(),
        })
    }

    async fn insert_street(&self, street: &NewStreet) -> StoreResult<Street> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO crab_street (name, crab_id, city_id, status)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&street.name)
        .bind(&street.crab_id)
        .bind(street.city_id)
        .bind(street.status.code())
        .fetch_one(&self.pool)
        .await
        .map_err(|err| insert_error("street", &street.crab_id, err))?;
        Ok(Street {
            id,
            fields: street.clone(),
        })
    }

    async fn insert_address(&self, address: &AddressFields) -> StoreResult<Address> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO crab_address
                (crab_id, street_id, house_number, apartment_number, sub_number, status, geom)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&address.crab_id)
        .bind(address.street_id)
        .bind(&address.house_number)
        .bind(&address.apartment_number)
        .bind(&address.sub_number)
        .bind(address.status.code())
        .bind(&address.geom)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| insert_error("address", &address.crab_id, err))?;
        Ok(Address {
            id,
            fields: address.clone(),
        })
    }

    async fn update_address(&self, address: &Address) -> StoreResult<()> {
        let fields = &address.fields;
        let result = sqlx::query(
            r#"
            UPDATE crab_address
               SET crab_id = $2,
                   street_id = $3,
                   house_number = $4,
                   apartment_number = $5,
                   sub_number = $6,
                   status = $7,
                   geom = $8
             WHERE id = $1
            "#,
        )
        .bind(address.id)
        .bind(&fields.crab_id)
        .bind(fields.street_id)
        .bind(&fields.house_number)
        .bind(&fields.apartment_number)
        .bind(&fields.sub_number)
        .bind(fields.status.code())
        .bind(&fields.geom)
        .execute(&self.pool)
        .await
        .map_err(|err| insert_error("address", &fields.crab_id, err))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "address",
                id: address.id,
            });
        }
        Ok(())
    }

    // Advisory locks are per session, so the connection stays out of the
    // pool until release.
    async fn try_acquire_run_lock(&self) -> StoreResult<bool> {
        let mut held = self.lock_conn.lock().await;
        if held.is_some() {
            return Ok(false);
        }
        let mut conn = self.pool.acquire().await.map_err(StoreError::backend)?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(RUN_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
            .map_err(StoreError::backend)?;
        if acquired {
            debug!("acquired CRAB run lock");
            *held = Some(conn);
        }
        Ok(acquired)
    }

    async fn release_run_lock(&self) -> StoreResult<()> {
        let Some(mut conn) = self.lock_conn.lock().await.take() else {
            return Ok(());
        };
        let released: bool = match sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(RUN_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(released) => released,
            Err(err) => {
                // Never hand a possibly locked session back to the pool.
                drop(conn.detach());
                return Err(StoreError::backend(err));
            }
        };
        if !released {
            warn!("CRAB run lock was not held by this session");
        }
        Ok(())
    }

    fn abandon_run_lock(&self) {
        let Ok(mut held) = self.lock_conn.try_lock() else {
            warn!("CRAB run lock connection is busy; leaving it in place");
            return;
        };
        if let Some(conn) = held.take() {
            // Closing the session drops its advisory locks server side.
            drop(conn.detach());
            warn!("closed the CRAB run lock session without unlocking");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_status_codes_decode() {
        assert_eq!(status_from_code(3).unwrap(), CrabStatus::InUse);
        assert_eq!(status_from_code(99).unwrap(), CrabStatus::NotFound);
        match status_from_code(7) {
            Err(StoreError::InvalidRow(message)) => assert!(message.contains('7')),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn non_constraint_errors_stay_backend_failures() {
        let err = insert_error("street", "S1", sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Backend(_)));

        let err = insert_error("address", "A1", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
