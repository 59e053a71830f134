use anyhow::{Context, bail};
use serde_json::{Value, json};

use super::{
    artifacts::MallConfig,
    types::{Evaluation, HookResult, SuccessCheck, TaskContext, TaskSpec},
};

pub const ROUTE_DISTANCE_TASK: &str = "route_distance_mcp";
pub const DEVICE_MODEL_TASK: &str = "device_model_lookup";
pub const MALL_ORDER_TASK: &str = "mall_order_ask_user";

/// Straight-line distance tool exposed by the Amap MCP server.
pub const DISTANCE_TOOL: &str = "maps_distance";
/// Hangzhou East Station to Shanghai REEL Mall, in km.
pub const REFERENCE_DISTANCE_KM: f64 = 157.254;
pub const DISTANCE_TOLERANCE_KM: f64 = 0.1;

const HANGZHOU_EAST_STATION: &str = "120.212851,30.290952";
const SHANGHAI_REEL_MALL: &str = "121.446375,31.226946";

const SHOE_SIZE: &str = "39";
const SUBMIT_ORDER_ACTION: &str = "提交订单";

pub fn tasks() -> Vec<TaskSpec> {
    vec![route_distance(), device_model(), mall_order()]
}

fn route_distance() -> TaskSpec {
    TaskSpec::new(
        ROUTE_DISTANCE_TASK,
        "I'm researching the history of a coffee chain. Last time I visited Manner's first \
         store; this time I want to see the chain's second store in China. Use the Amap MCP \
         to find the straight-line distance in km from Hangzhou East Station to it. \
         Answer with the number only.",
        SuccessCheck::future(check_route_distance),
    )
    .apps(["MCP-Amap", "Chrome"])
    .tags(["agent-mcp", "lang-en"])
}

async fn check_route_distance(ctx: TaskContext) -> HookResult<Evaluation> {
    let answer = ctx.answer().trim().to_string();
    let distance: f64 = match answer.parse() {
        Ok(distance) => distance,
        Err(_) => {
            return Ok(Evaluation::failure(format!(
                "Invalid answer: '{answer}'. Please answer with a number."
            )));
        }
    };

    let result = ctx
        .tools()
        .call_tool(
            DISTANCE_TOOL,
            json!({
                "origins": HANGZHOU_EAST_STATION,
                "destination": SHANGHAI_REEL_MALL,
                "type": "0",
            }),
        )
        .await;
    let expected = match result.json().as_ref().and_then(distance_km) {
        Some(expected) => expected,
        None => {
            tracing::warn!(
                task = ROUTE_DISTANCE_TASK,
                error = ?result.error(),
                "no distance from tool, using the reference value"
            );
            REFERENCE_DISTANCE_KM
        }
    };

    let score = if (distance - expected).abs() <= DISTANCE_TOLERANCE_KM {
        1.0
    } else {
        0.0
    };
    Ok(Evaluation::new(
        score,
        format!("Distance: {distance}, Expected: {expected}, Tolerance: {DISTANCE_TOLERANCE_KM}"),
    ))
}

/// Reads a distance in km out of a tool reply. Plain numbers are taken as
/// km; Amap's `results[].distance` field is in metres.
fn distance_km(reply: &Value) -> Option<f64> {
    match reply {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(_) => reply
            .pointer("/results/0/distance")
            .and_then(|metres| match metres {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .map(|metres| metres / 1000.0),
        _ => None,
    }
}

fn device_model() -> TaskSpec {
    TaskSpec::new(
        DEVICE_MODEL_TASK,
        "Open Settings, find this phone's model name under About phone and reply with \
         the model name only.",
        SuccessCheck::sync(check_device_model),
    )
    .apps(["Settings"])
    .tags(["lang-en"])
}

fn check_device_model(ctx: &TaskContext) -> HookResult<Evaluation> {
    let result = ctx.device().execute_shell("getprop ro.product.model", false);
    if !result.success {
        bail!(
            "getprop failed: {}",
            result.error.unwrap_or_else(|| "no output".to_string())
        );
    }
    let model = result.output.trim();
    let answer = ctx.answer().trim();
    if !model.is_empty() && answer.eq_ignore_ascii_case(model) {
        Ok(Evaluation::success(format!("Model: {model}")))
    } else {
        Ok(Evaluation::failure(format!(
            "Incorrect model: '{answer}' (expected: '{model}')"
        )))
    }
}

fn mall_order() -> TaskSpec {
    TaskSpec::new(
        MALL_ORDER_TASK,
        "Find a pair of white shoes for my daily commute in the TaoDian app and place an \
         order in my usual size, using the default recipient and address.",
        SuccessCheck::sync(check_mall_order),
    )
    .apps(["Taodian"])
    .tags(["agent-user-interaction", "lang-en"])
    .on_initialize(|ctx| {
        let config = MallConfig {
            show_splash_ad: true,
            require_login: false,
            ..MallConfig::default()
        };
        ctx.artifacts()
            .write_mall_config(ctx.device_name(), &config)
            .context("writing mall config")?;
        ctx.set_relevant_information(format!(
            "If anyone asks you about your shoe size or what size you wear, \
             you need to answer '{SHOE_SIZE}'."
        ));
        Ok(true)
    })
    .on_tear_down(|ctx| {
        ctx.artifacts().clear_mall_config(ctx.device_name())?;
        ctx.artifacts().clear_callbacks(ctx.device_name())?;
        Ok(true)
    })
}

fn check_mall_order(ctx: &TaskContext) -> HookResult<Evaluation> {
    let callbacks = ctx.artifacts().recent_callbacks(ctx.device_name(), 1)?;
    let Some(order) = callbacks.first() else {
        return Ok(Evaluation::failure("No callback data found"));
    };
    Ok(match order_mismatch(order) {
        Some(reason) => Evaluation::failure(reason),
        None => Evaluation::success("Order matches"),
    })
}

fn order_mismatch(order: &Value) -> Option<String> {
    if order.get("task_name").and_then(Value::as_str) != Some(SUBMIT_ORDER_ACTION) {
        return Some("Conducted action type on taodian is wrong".to_string());
    }

    let products = order
        .get("product_info")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let [product] = products else {
        return Some("Product info length does not match".to_string());
    };
    let field = |key: &str| product.get(key).and_then(Value::as_str).unwrap_or_default();
    if !field("prodName").contains("白色") {
        return Some("Product name does not contain '白色'".to_string());
    }
    if !field("skuName").contains(SHOE_SIZE) {
        return Some("SKU name (size) does not match user-provided size".to_string());
    }
    if product.get("prodCount").and_then(Value::as_u64) != Some(1) {
        return Some("Product count does not match".to_string());
    }

    let Some(address) = order.get("address_info") else {
        return Some("Address info is missing".to_string());
    };
    let missing: Vec<&str> = ["receiver", "mobile", "addr", "province", "city", "area"]
        .into_iter()
        .filter(|key| {
            address
                .get(*key)
                .is_none_or(|value| value.is_null() || value.as_str() == Some(""))
        })
        .collect();
    if !missing.is_empty() {
        return Some(format!(
            "Address info is incomplete. Missing fields: {missing:?}"
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distances_are_read_in_km() {
        assert_eq!(distance_km(&json!(157.254)), Some(157.254));
        assert_eq!(distance_km(&json!(" 157.254 ")), Some(157.254));
        assert_eq!(
            distance_km(&json!({"results": [{"distance": "157254"}]})),
            Some(157.254)
        );
        assert_eq!(distance_km(&json!({"status": "0"})), None);
        assert_eq!(distance_km(&json!("not a number")), None);
    }

    fn order() -> Value {
        json!({
            "task_name": "提交订单",
            "product_info": [{"prodName": "白色帆布鞋", "skuName": "39码", "prodCount": 1}],
            "address_info": {
                "receiver": "Mashu", "mobile": "13800000000", "addr": "1 Road",
                "province": "Zhejiang", "city": "Hangzhou", "area": "Xihu"
            }
        })
    }

    #[test]
    fn matching_orders_pass() {
        assert_eq!(order_mismatch(&order()), None);
    }

    #[test]
    fn order_mismatches_are_explained() {
        let mut wrong_size = order();
        wrong_size["product_info"][0]["skuName"] = json!("42码");
        assert!(order_mismatch(&wrong_size).unwrap().contains("size"));

        let mut two_products = order();
        two_products["product_info"] = json!([{}, {}]);
        assert!(order_mismatch(&two_products).unwrap().contains("length"));

        let mut no_city = order();
        no_city["address_info"]["city"] = json!("");
        assert!(order_mismatch(&no_city).unwrap().contains("city"));

        let mut browsing = order();
        browsing["task_name"] = json!("加入购物车");
        assert!(order_mismatch(&browsing).unwrap().contains("action type"));
    }

    #[test]
    fn builtin_names_are_unique() {
        let tasks = tasks();
        let mut names: Vec<&str> = tasks.iter().map(|task| task.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), tasks.len());
    }
}
