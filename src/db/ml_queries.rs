use chrono::Utc;
use sqlx::PgPool;

use crate::errors::AppError;
use crate::models::{DriverPrediction, ModelInfo, SafeDriverScore, TrainedModel};

/// Feature columns fed to the logistic regression, in coefficient order.
/// The leading `1` is the intercept term.
const MODEL_FEATURES: &str =
    "ARRAY[1, speed_compliance_rate, avg_g_force, harsh_driving_events, phone_usage_rate, speed_variance]";

/// Rebuild `driver_ml_training_data` from raw telemetry and accident history.
///
/// Returns the number of driver rows written.
pub async fn refresh_training_data(pool: &PgPool) -> Result<u64, AppError> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM driver_ml_training_data")
        .execute(&mut *tx)
        .await?;

    let result = sqlx::query(
        r#"
        INSERT INTO driver_ml_training_data (
            driver_id,
            total_events,
            speed_compliance_rate,
            avg_g_force,
            harsh_driving_events,
            phone_usage_rate,
            speed_variance,
            accident_count,
            has_accident
        )
        SELECT
            e.driver_id,
            COUNT(*),
            AVG(CASE WHEN e.speed_mph <= e.speed_limit_mph THEN 100.0 ELSE 0.0 END),
            AVG(e.g_force),
            SUM(CASE WHEN e.g_force > 0.5 THEN 1 ELSE 0 END),
            AVG(CASE WHEN e.device_screen_on AND e.speed_mph > 5 THEN 100.0 ELSE 0.0 END),
            COALESCE(VARIANCE(e.speed_mph), 0),
            COALESCE(a.accident_count, 0),
            CASE WHEN COALESCE(a.accident_count, 0) > 0 THEN 1 ELSE 0 END
        FROM vehicle_events e
        LEFT JOIN (
            SELECT driver_id, COUNT(*) AS accident_count
            FROM accidents
            GROUP BY driver_id
        ) a ON a.driver_id = e.driver_id
        WHERE e.driver_id IS NOT NULL
        GROUP BY e.driver_id, a.accident_count
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(result.rows_affected())
}

/// Drop the previous MADlib output tables so training can recreate them.
pub async fn drop_accident_model(pool: &PgPool) -> Result<(), AppError> {
    sqlx::query("DROP TABLE IF EXISTS driver_accident_model, driver_accident_model_summary")
        .execute(pool)
        .await?;
    Ok(())
}

/// Train the accident model with MADlib's `logregr_train` and read back its summary row.
pub async fn train_accident_model(pool: &PgPool) -> Result<TrainedModel, AppError> {
    let train_sql = format!(
        "SELECT madlib.logregr_train('driver_ml_training_data', 'driver_accident_model', 'has_accident', '{}')",
        MODEL_FEATURES
    );
    sqlx::query(&train_sql).execute(pool).await?;

    let (num_iterations, num_rows_processed, log_likelihood) =
        sqlx::query_as::<_, (i32, i64, Option<f64>)>(
            r#"
            SELECT num_iterations, num_rows_processed, log_likelihood
            FROM driver_accident_model
            LIMIT 1
            "#,
        )
        .fetch_one(pool)
        .await?;

    Ok(TrainedModel {
        num_iterations,
        num_rows_processed,
        log_likelihood,
    })
}

/// Score every driver in the training table against the freshly trained model.
pub async fn predict_accident_probabilities(
    pool: &PgPool,
) -> Result<Vec<DriverPrediction>, AppError> {
    let sql = format!(
        r#"
        SELECT
            d.driver_id,
            madlib.logregr_predict_prob(m.coef, {})::float8 AS accident_probability
        FROM driver_ml_training_data d
        CROSS JOIN driver_accident_model m
        ORDER BY d.driver_id
        "#,
        MODEL_FEATURES
    );

    let predictions = sqlx::query_as::<_, DriverPrediction>(&sql)
        .fetch_all(pool)
        .await?;

    Ok(predictions)
}

/// Insert one `safe_driver_scores` row per driver in a single transaction.
///
/// Returns the number of rows written.
pub async fn insert_safe_driver_scores(
    pool: &PgPool,
    scores: &[SafeDriverScore],
) -> Result<u64, AppError> {
    let calculated_at = Utc::now();
    let mut tx = pool.begin().await?;
    let mut written = 0;

    for score in scores {
        let result = sqlx::query(
            r#"
            INSERT INTO safe_driver_scores (driver_id, score, risk_category, calculation_date)
            VALUES ($1, $2::numeric(5, 2), $3, $4)
            "#,
        )
        .bind(score.driver_id)
        .bind(score.score)
        .bind(score.risk_category.as_str())
        .bind(calculated_at)
        .execute(&mut *tx)
        .await?;

        written += result.rows_affected();
    }

    tx.commit().await?;

    Ok(written)
}

/// Load the current accident model, if one has been trained.
pub async fn fetch_model_info(pool: &PgPool) -> Result<Option<ModelInfo>, AppError> {
    let row = sqlx::query_as::<_, (Option<i32>, Option<i64>, Option<f64>, Option<Vec<f64>>)>(
        r#"
        SELECT num_iterations, num_rows_processed, log_likelihood, coef
        FROM driver_accident_model
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await;

    let row = match row {
        Ok(row) => row,
        // 42P01: the model table has not been created yet
        Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("42P01") => None,
        Err(e) => return Err(AppError::Db(e)),
    };

    Ok(row.map(|(num_iterations, num_rows_processed, log_likelihood, coef)| ModelInfo {
        model_id: num_iterations
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        algorithm: "Logistic Regression".to_string(),
        num_iterations,
        num_rows_processed,
        log_likelihood,
        coefficients: coef.unwrap_or_default(),
        status: "ACTIVE".to_string(),
    }))
}
