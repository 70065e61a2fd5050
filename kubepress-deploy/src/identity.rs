//! Microsoft Graph provisioners for the cluster's AD identity

use crate::context::DeployContext;
use crate::provisioner::{expect_spec, field_str, Fields, Provisioner};
use crate::{DeployError, Result};
use async_trait::async_trait;
use kubepress_common::{Declaration, Outputs, ResourceKind};
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

fn application_path(unique_name: &str) -> String {
    format!("/applications(uniqueName='{}')", urlencoding::encode(unique_name))
}

fn required_str<'a>(object: &'a Value, key: &str, resource: &str) -> Result<&'a str> {
    object
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| DeployError::unexpected(resource, format!("response has no {}", key)))
}

/// App registration, upserted by unique name so re-applies converge
pub struct ApplicationProvisioner;

#[async_trait]
impl Provisioner for ApplicationProvisioner {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Application
    }

    async fn create_or_update(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        outputs: &Outputs,
    ) -> Result<Fields> {
        expect_spec!(declaration, Application);
        let path = application_path(&declaration.id.name);
        let _: Value = ctx
            .graph
            .request(
                Method::PATCH,
                &path,
                Some(&declaration.render(outputs)),
                &[("prefer", "create-if-missing")],
            )
            .await?;

        let application: Value = ctx.graph.get(&path).await?;
        let resource = declaration.id.to_string();
        Ok(BTreeMap::from([
            ("id".to_string(), json!(required_str(&application, "id", &resource)?)),
            (
                "application_id".to_string(),
                json!(required_str(&application, "appId", &resource)?),
            ),
        ]))
    }

    async fn delete(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        _recorded: &Fields,
        _outputs: &Outputs,
    ) -> Result<()> {
        ctx.graph
            .delete(&application_path(&declaration.id.name))
            .await?;
        Ok(())
    }
}

/// Service principal of an application, looked up by appId before creating
pub struct ServicePrincipalProvisioner;

impl ServicePrincipalProvisioner {
    async fn find(ctx: &DeployContext, app_id: &str) -> Result<Option<Value>> {
        let filter = format!("appId eq '{}'", app_id);
        let path = format!("/servicePrincipals?$filter={}", urlencoding::encode(&filter));
        let list: Value = ctx.graph.get(&path).await?;
        Ok(list
            .get("value")
            .and_then(Value::as_array)
            .and_then(|found| found.first())
            .cloned())
    }
}

#[async_trait]
impl Provisioner for ServicePrincipalProvisioner {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ServicePrincipal
    }

    async fn create_or_update(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        outputs: &Outputs,
    ) -> Result<Fields> {
        let spec = expect_spec!(declaration, ServicePrincipal);
        let app_id = spec.application_id.resolve(outputs)?;

        let principal = match Self::find(ctx, &app_id).await? {
            Some(existing) => {
                debug!(app_id = %app_id, "Service principal already exists");
                existing
            }
            None => ctx.graph.post("/servicePrincipals", &declaration.render(outputs)).await?,
        };

        let resource = declaration.id.to_string();
        Ok(BTreeMap::from([
            ("id".to_string(), json!(required_str(&principal, "id", &resource)?)),
            ("application_id".to_string(), json!(app_id)),
        ]))
    }

    async fn delete(
        &self,
        ctx: &DeployContext,
        _declaration: &Declaration,
        recorded: &Fields,
        _outputs: &Outputs,
    ) -> Result<()> {
        let id = field_str(recorded, "id")
            .ok_or_else(|| DeployError::unexpected("service principal", "no recorded id"))?;
        ctx.graph
            .delete(&format!("/servicePrincipals/{}", id))
            .await?;
        Ok(())
    }
}

/// Client secret generated by Graph; the value is only returned once
pub struct PasswordProvisioner;

#[async_trait]
impl Provisioner for PasswordProvisioner {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ServicePrincipalPassword
    }

    async fn create_or_update(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        outputs: &Outputs,
    ) -> Result<Fields> {
        let spec = expect_spec!(declaration, ServicePrincipalPassword);
        let principal = spec.service_principal_id.resolve(outputs)?;

        // A credential cannot be read back, so a re-apply reuses the recorded
        // secret as long as it still belongs to the same principal
        if let Some(recorded) = outputs.fields(&declaration.id) {
            let owner = field_str(recorded, "service_principal_id");
            if field_str(recorded, "value").is_some() && owner.as_deref() == Some(principal.as_str()) {
                debug!(resource = %declaration.id, "Reusing recorded secret");
                return Ok(recorded.clone());
            }
            if owner.is_some() {
                warn!(resource = %declaration.id, "Service principal changed; generating a new secret");
            }
        }

        let credential: Value = ctx
            .graph
            .post(
                &format!("/servicePrincipals/{}/addPassword", principal),
                &declaration.render(outputs),
            )
            .await?;
        info!(resource = %declaration.id, "Generated client secret");

        let resource = declaration.id.to_string();
        Ok(BTreeMap::from([
            ("key_id".to_string(), json!(required_str(&credential, "keyId", &resource)?)),
            ("value".to_string(), json!(required_str(&credential, "secretText", &resource)?)),
            ("service_principal_id".to_string(), json!(principal)),
        ]))
    }

    async fn delete(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        recorded: &Fields,
        _outputs: &Outputs,
    ) -> Result<()> {
        let (Some(principal), Some(key_id)) = (
            field_str(recorded, "service_principal_id"),
            field_str(recorded, "key_id"),
        ) else {
            warn!(resource = %declaration.id, "No recorded key id; nothing to remove");
            return Ok(());
        };
        let _: Value = ctx
            .graph
            .post(
                &format!("/servicePrincipals/{}/removePassword", principal),
                &json!({ "keyId": key_id }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RestClient;
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use kubepress_common::azure::{Application, ServicePrincipal, ServicePrincipalPassword};
    use kubepress_common::{ResourceId, ResourceSpec};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeGraph {
        calls: Arc<Mutex<Vec<String>>>,
        principal_exists: bool,
    }

    async fn fake_graph(principal_exists: bool) -> (DeployContext, FakeGraph) {
        let state = FakeGraph {
            principal_exists,
            ..Default::default()
        };
        let app = Router::new()
            .route(
                "/applications(uniqueName='aks')",
                get(|| async { Json(json!({ "id": "obj-1", "appId": "app-1" })) }).patch(
                    |State(s): State<FakeGraph>, Json(body): Json<Value>| async move {
                        s.calls.lock().unwrap().push(format!("patch {}", body["displayName"]));
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .route(
                "/servicePrincipals",
                get(
                    |State(s): State<FakeGraph>, Query(q): Query<HashMap<String, String>>| async move {
                        assert_eq!(q["$filter"], "appId eq 'app-1'");
                        let value = if s.principal_exists {
                            vec![json!({ "id": "sp-existing", "appId": "app-1" })]
                        } else {
                            vec![]
                        };
                        Json(json!({ "value": value }))
                    },
                )
                .post(|State(s): State<FakeGraph>, Json(body): Json<Value>| async move {
                    s.calls.lock().unwrap().push(format!("create sp {}", body["appId"]));
                    (StatusCode::CREATED, Json(json!({ "id": "sp-new", "appId": body["appId"] })))
                }),
            )
            .route(
                "/servicePrincipals/:id/addPassword",
                post(|State(s): State<FakeGraph>, Json(body): Json<Value>| async move {
                    s.calls
                        .lock()
                        .unwrap()
                        .push(format!("addPassword {}", body["passwordCredential"]["endDateTime"]));
                    Json(json!({ "keyId": "key-1", "secretText": "generated" }))
                }),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let url = format!("http://{}", addr);
        let ctx = DeployContext::new(
            RestClient::new(&url).unwrap(),
            RestClient::new(&url).unwrap(),
            "sub",
        );
        (ctx, state)
    }

    fn application() -> Declaration {
        Declaration::new(
            "aks",
            ResourceSpec::Application(Application {
                display_name: "aks".to_string(),
            }),
        )
    }

    fn principal(app: &ResourceId) -> Declaration {
        Declaration::new(
            "aksSp",
            ResourceSpec::ServicePrincipal(ServicePrincipal {
                application_id: app.output("application_id").into(),
            }),
        )
    }

    fn app_outputs(app: &ResourceId) -> Outputs {
        let mut outputs = Outputs::new();
        outputs.record(
            app.clone(),
            BTreeMap::from([("application_id".to_string(), json!("app-1"))]),
        );
        outputs
    }

    #[tokio::test]
    async fn test_application_upsert() {
        let (ctx, state) = fake_graph(false).await;
        let fields = ApplicationProvisioner
            .create_or_update(&ctx, &application(), &Outputs::new())
            .await
            .unwrap();
        assert_eq!(fields["id"], "obj-1");
        assert_eq!(fields["application_id"], "app-1");
        assert_eq!(*state.calls.lock().unwrap(), vec!["patch \"aks\""]);
    }

    #[tokio::test]
    async fn test_service_principal_created_when_missing() {
        let (ctx, state) = fake_graph(false).await;
        let app = application().id;
        let fields = ServicePrincipalProvisioner
            .create_or_update(&ctx, &principal(&app), &app_outputs(&app))
            .await
            .unwrap();
        assert_eq!(fields["id"], "sp-new");
        assert_eq!(*state.calls.lock().unwrap(), vec!["create sp \"app-1\""]);
    }

    #[tokio::test]
    async fn test_service_principal_reused_when_present() {
        let (ctx, state) = fake_graph(true).await;
        let app = application().id;
        let fields = ServicePrincipalProvisioner
            .create_or_update(&ctx, &principal(&app), &app_outputs(&app))
            .await
            .unwrap();
        assert_eq!(fields["id"], "sp-existing");
        assert!(state.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_password_generated_once() {
        let (ctx, state) = fake_graph(false).await;
        let sp = ResourceId::new(ResourceKind::ServicePrincipal, "aksSp");
        let declaration = Declaration::new(
            "aksSpPassword",
            ResourceSpec::ServicePrincipalPassword(ServicePrincipalPassword {
                service_principal_id: sp.output("id").into(),
                display_name: "aksSpPassword".to_string(),
                end_date: "2099-01-01T00:00:00Z".to_string(),
            }),
        );
        let mut outputs = Outputs::new();
        outputs.record(sp.clone(), BTreeMap::from([("id".to_string(), json!("sp-new"))]));

        let fields = PasswordProvisioner
            .create_or_update(&ctx, &declaration, &outputs)
            .await
            .unwrap();
        assert_eq!(fields["value"], "generated");
        assert_eq!(fields["key_id"], "key-1");

        outputs.record(declaration.id.clone(), fields.clone());
        let again = PasswordProvisioner
            .create_or_update(&ctx, &declaration, &outputs)
            .await
            .unwrap();
        assert_eq!(again, fields);
        assert_eq!(
            *state.calls.lock().unwrap(),
            vec!["addPassword \"2099-01-01T00:00:00Z\""]
        );

        // A recreated principal invalidates the recorded secret
        outputs.record(sp, BTreeMap::from([("id".to_string(), json!("sp-recreated"))]));
        let rotated = PasswordProvisioner
            .create_or_update(&ctx, &declaration, &outputs)
            .await
            .unwrap();
        assert_eq!(rotated["service_principal_id"], "sp-recreated");
        assert_eq!(state.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_application_path_is_encoded() {
        assert_eq!(application_path("aks"), "/applications(uniqueName='aks')");
        assert_eq!(application_path("my app"), "/applications(uniqueName='my%20app')");
    }
}
