//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了订单持久化接口和基于Sea-ORM的实现。

use super::AdmissionTicket;
use crate::config::DatabaseConfig;
use crate::error::{FlashError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, Statement,
    TransactionTrait, Value,
};
use secrecy::ExposeSecret;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// 优惠券订单
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoucherOrder {
    pub id: u64,
    pub user_id: u64,
    pub voucher_id: u64,
    pub create_time: DateTime<Utc>,
}

impl VoucherOrder {
    pub fn from_ticket(ticket: &AdmissionTicket) -> Self {
        Self {
            id: ticket.order_id,
            user_id: ticket.user_id,
            voucher_id: ticket.voucher_id,
            create_time: Utc::now(),
        }
    }
}

/// 订单写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderCommit {
    /// 新订单已写入
    Created,
    /// 该用户已有此优惠券的订单，未写入
    AlreadyExists,
}

/// 订单仓储
///
/// `create_order` 必须在同一事务中完成：检查用户是否已下单、
/// 以 `stock > 0` 为条件扣减库存、写入订单。库存扣减失败返回
/// [`FlashError::StockUnavailable`]。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderRepository: Send + Sync + 'static {
    async fn create_order(&self, order: &VoucherOrder) -> Result<OrderCommit>;
}

const CREATE_VOUCHER_TABLE: &str = "CREATE TABLE IF NOT EXISTS tb_seckill_voucher (
    voucher_id BIGINT NOT NULL PRIMARY KEY,
    stock BIGINT NOT NULL
)";

const CREATE_ORDER_TABLE: &str = "CREATE TABLE IF NOT EXISTS tb_voucher_order (
    id BIGINT NOT NULL PRIMARY KEY,
    user_id BIGINT NOT NULL,
    voucher_id BIGINT NOT NULL,
    create_time VARCHAR(64) NOT NULL,
    UNIQUE (user_id, voucher_id)
)";

/// 基于Sea-ORM的订单仓储，支持SQLite、PostgreSQL和MySQL
#[derive(Debug, Clone)]
pub struct SeaOrmOrderRepository {
    connection: DatabaseConnection,
}

fn to_db_id(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| FlashError::NotSupported(format!("ID {} exceeds BIGINT range", value)))
}

impl SeaOrmOrderRepository {
    /// 按配置连接数据库
    #[instrument(skip(config), level = "info", name = "connect_order_repository")]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config.url.expose_secret().to_string();
        let mut opt = ConnectOptions::new(url.clone());
        // 内存SQLite的每条连接是一个独立的库
        if url.starts_with("sqlite") {
            opt.max_connections(1).min_connections(1);
        } else {
            opt.max_connections(config.max_connections);
        }
        opt.connect_timeout(Duration::from_secs(30))
            .sqlx_logging(false);

        let connection = Database::connect(opt).await?;
        info!(
            "Order repository connected ({:?})",
            connection.get_database_backend()
        );
        Ok(Self { connection })
    }

    pub fn from_connection(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn backend(&self) -> DatabaseBackend {
        self.connection.get_database_backend()
    }

    /// 按数据库类型把 `?` 占位符改写为 `$n`
    fn statement(&self, sql: &str, values: Vec<Value>) -> Statement {
        let backend = self.backend();
        let sql = if backend == DatabaseBackend::Postgres {
            let mut rewritten = String::with_capacity(sql.len() + 8);
            let mut index = 0;
            for c in sql.chars() {
                if c == '?' {
                    index += 1;
                    rewritten.push_str(&format!("${}", index));
                } else {
                    rewritten.push(c);
                }
            }
            rewritten
        } else {
            sql.to_string()
        };
        Statement::from_sql_and_values(backend, sql, values)
    }

    /// 创建所需的表
    pub async fn init_schema(&self) -> Result<()> {
        let backend = self.backend();
        for sql in [CREATE_VOUCHER_TABLE, CREATE_ORDER_TABLE] {
            self.connection
                .execute(Statement::from_string(backend, sql.to_string()))
                .await?;
        }
        debug!("Order tables ensured");
        Ok(())
    }

    /// 写入或覆盖秒杀券库存
    #[instrument(skip(self), level = "debug")]
    pub async fn upsert_voucher_stock(&self, voucher_id: u64, stock: u64) -> Result<()> {
        let sql = if self.backend() == DatabaseBackend::MySql {
            "INSERT INTO tb_seckill_voucher (voucher_id, stock) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE stock = VALUES(stock)"
        } else {
            "INSERT INTO tb_seckill_voucher (voucher_id, stock) VALUES (?, ?) \
             ON CONFLICT (voucher_id) DO UPDATE SET stock = excluded.stock"
        };
        let values = vec![to_db_id(voucher_id)?.into(), to_db_id(stock)?.into()];
        self.connection.execute(self.statement(sql, values)).await?;
        Ok(())
    }

    /// 查询数据库中的剩余库存
    pub async fn stock_of(&self, voucher_id: u64) -> Result<Option<i64>> {
        let row = self
            .connection
            .query_one(self.statement(
                "SELECT stock FROM tb_seckill_voucher WHERE voucher_id = ?",
                vec![to_db_id(voucher_id)?.into()],
            ))
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<i64>("", "stock")?)),
            None => Ok(None),
        }
    }

    /// 统计某张券的订单数
    pub async fn count_orders(&self, voucher_id: u64) -> Result<u64> {
        let row = self
            .connection
            .query_one(self.statement(
                "SELECT COUNT(*) AS cnt FROM tb_voucher_order WHERE voucher_id = ?",
                vec![to_db_id(voucher_id)?.into()],
            ))
            .await?;
        let count = match row {
            Some(row) => row.try_get::<i64>("", "cnt")?,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl OrderRepository for SeaOrmOrderRepository {
    #[instrument(skip(self, order), level = "debug", fields(order_id = order.id, user_id = order.user_id))]
    async fn create_order(&self, order: &VoucherOrder) -> Result<OrderCommit> {
        let user_id = to_db_id(order.user_id)?;
        let voucher_id = to_db_id(order.voucher_id)?;
        let txn = self.connection.begin().await?;

        let existing = txn
            .query_one(self.statement(
                "SELECT COUNT(*) AS cnt FROM tb_voucher_order WHERE user_id = ? AND voucher_id = ?",
                vec![user_id.into(), voucher_id.into()],
            ))
            .await?
            .map(|row| row.try_get::<i64>("", "cnt"))
            .transpose()?
            .unwrap_or(0);
        if existing > 0 {
            debug!("User {} already ordered voucher {}", order.user_id, order.voucher_id);
            txn.rollback().await?;
            return Ok(OrderCommit::AlreadyExists);
        }

        let updated = txn
            .execute(self.statement(
                "UPDATE tb_seckill_voucher SET stock = stock - 1 WHERE voucher_id = ? AND stock > 0",
                vec![voucher_id.into()],
            ))
            .await?;
        if updated.rows_affected() == 0 {
            txn.rollback().await?;
            return Err(FlashError::StockUnavailable(order.voucher_id));
        }

        txn.execute(self.statement(
            "INSERT INTO tb_voucher_order (id, user_id, voucher_id, create_time) VALUES (?, ?, ?, ?)",
            vec![
                to_db_id(order.id)?.into(),
                user_id.into(),
                voucher_id.into(),
                order.create_time.to_rfc3339().into(),
            ],
        ))
        .await?;
        txn.commit().await?;
        Ok(OrderCommit::Created)
    }
}
