use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::observability;
use crate::tenant::gym_file_stem;

/// Single shared password for every user and database. Gyms are separated by
/// database name, not by credentials.
#[derive(Debug)]
pub struct FitbookAuthSource {
    password: String,
}

impl FitbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

/// The gym a login targets. Connections without a database land in `default`,
/// the same tenant the query handler resolves them to.
fn gym_for(database: Option<&str>) -> Result<String, PgWireError> {
    gym_file_stem(database.unwrap_or("default")).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "FATAL".into(),
            "3D000".into(),
            format!("database cannot name a gym: {e}"),
        )))
    })
}

#[async_trait]
impl AuthSource for FitbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let gym = match gym_for(login.database().as_deref()) {
            Ok(gym) => gym,
            Err(e) => {
                metrics::counter!(observability::AUTH_CHALLENGES_TOTAL, "gym" => "rejected")
                    .increment(1);
                tracing::info!(database = ?login.database(), "login for unusable database");
                return Err(e);
            }
        };
        tracing::debug!(user = ?login.user(), gym = %gym, "password challenge");
        metrics::counter!(observability::AUTH_CHALLENGES_TOTAL, "gym" => gym).increment(1);
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
