//! User directory backed by the `users` table of any [`DataAccess`].

use std::sync::Arc;

use super::{DataAccess, Filter, UserDirectory};
use crate::error::BackendError;
use crate::model::{DirectoryUser, decode_row};

pub struct TableDirectory {
    data: Arc<dyn DataAccess>,
    table: String,
}

impl TableDirectory {
    #[must_use]
    pub fn new(data: Arc<dyn DataAccess>, table: impl Into<String>) -> Self {
        Self { data, table: table.into() }
    }
}

#[async_trait::async_trait]
impl UserDirectory for TableDirectory {
    async fn get_user(&self, user_id: &str) -> Result<Option<DirectoryUser>, BackendError> {
        let rows = self.data.query(&self.table, &Filter::eq("id", user_id), None).await?;
        rows.first().map(decode_row::<DirectoryUser>).transpose()
    }
}

#[cfg(test)]
#[path = "directory_test.rs"]
mod tests;
