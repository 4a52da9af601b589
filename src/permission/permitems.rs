//! The platform's standard permission tree.

use tsuru_types::ContextType;
use tsuru_types::ContextType::*;

use super::registry::PermissionRegistry;
use crate::error::Result;

const APP: &[ContextType] = &[App, Team, Pool];
const TEAM: &[ContextType] = &[Team];
const POOL: &[ContextType] = &[Pool];
const IAAS: &[ContextType] = &[Iaas];
const USER: &[ContextType] = &[User];
const SERVICE: &[ContextType] = &[Service, Team];
const SERVICE_INSTANCE: &[ContextType] = &[ServiceInstance, Team];
const VOLUME: &[ContextType] = &[Volume, Team, Pool];
const ROUTER: &[ContextType] = &[Router];
const GLOBAL_ONLY: &[ContextType] = &[];

/// `(dotted name, own context list)`; `None` inherits from the parent.
const ITEMS: &[(&str, Option<&[ContextType]>)] = &[
    // app
    ("app", Some(APP)),
    ("app.create", None),
    ("app.delete", None),
    ("app.read", None),
    ("app.read.env", None),
    ("app.read.log", None),
    ("app.read.metric", None),
    ("app.read.events", None),
    ("app.read.router", None),
    ("app.update", None),
    ("app.update.description", None),
    ("app.update.tags", None),
    ("app.update.plan", None),
    ("app.update.pool", None),
    ("app.update.team-owner", None),
    ("app.update.team.add", None),
    ("app.update.team.remove", None),
    ("app.update.platform", None),
    ("app.update.env.set", None),
    ("app.update.env.unset", None),
    ("app.update.bind", None),
    ("app.update.unbind", None),
    ("app.update.restart", None),
    ("app.update.start", None),
    ("app.update.stop", None),
    ("app.update.sleep", None),
    ("app.update.grow", None),
    ("app.update.shrink", None),
    ("app.update.cname.add", None),
    ("app.update.cname.remove", None),
    ("app.update.router.add", None),
    ("app.update.router.update", None),
    ("app.update.router.remove", None),
    ("app.update.log", None),
    ("app.deploy", None),
    ("app.deploy.rollback", None),
    ("app.run", None),
    ("app.run.shell", None),
    ("app.admin.unlock", None),
    ("app.admin.quota", None),
    ("app.admin.routes", None),
    ("app.build", None),
    // node / machine
    ("node", Some(POOL)),
    ("node.create", None),
    ("node.read", None),
    ("node.update", None),
    ("node.update.move.containers", None),
    ("node.delete", None),
    ("node.autoscale", Some(GLOBAL_ONLY)),
    ("machine", Some(IAAS)),
    ("machine.delete", None),
    ("machine.read", None),
    ("machine.template", Some(GLOBAL_ONLY)),
    ("machine.template.create", None),
    ("machine.template.delete", None),
    ("machine.template.read", None),
    ("machine.template.update", None),
    // team / user
    ("team", Some(TEAM)),
    ("team.create", Some(GLOBAL_ONLY)),
    ("team.read", None),
    ("team.read.events", None),
    ("team.update", None),
    ("team.delete", None),
    ("team.token.read", None),
    ("team.token.create", None),
    ("team.token.update", None),
    ("team.token.delete", None),
    ("user", Some(USER)),
    ("user.create", Some(GLOBAL_ONLY)),
    ("user.delete", None),
    ("user.read.events", None),
    ("user.read.quota", None),
    ("user.update.token", None),
    ("user.update.quota", None),
    ("user.update.password", None),
    ("user.update.reset", None),
    ("user.update.key.add", None),
    ("user.update.key.remove", None),
    // services
    ("service", Some(SERVICE)),
    ("service.create", Some(TEAM)),
    ("service.read", None),
    ("service.read.doc", None),
    ("service.read.plans", None),
    ("service.read.access", None),
    ("service.read.events", None),
    ("service.update", None),
    ("service.update.proxy", None),
    ("service.update.revoke-access", None),
    ("service.update.grant-access", None),
    ("service.update.doc", None),
    ("service.delete", None),
    ("service-instance", Some(SERVICE_INSTANCE)),
    ("service-instance.create", Some(TEAM)),
    ("service-instance.read", None),
    ("service-instance.read.status", None),
    ("service-instance.read.events", None),
    ("service-instance.delete", None),
    ("service-instance.update", None),
    ("service-instance.update.proxy", None),
    ("service-instance.update.bind", None),
    ("service-instance.update.unbind", None),
    ("service-instance.update.grant", None),
    ("service-instance.update.revoke", None),
    ("service-instance.update.description", None),
    ("service-instance.update.tags", None),
    ("service-instance.update.teamowner", None),
    ("service-instance.update.plan", None),
    ("service-instance.update.parameters", None),
    // platform-wide
    ("pool", Some(POOL)),
    ("pool.create", Some(GLOBAL_ONLY)),
    ("pool.read", None),
    ("pool.read.events", None),
    ("pool.update", None),
    ("pool.update.team.add", None),
    ("pool.update.team.remove", None),
    ("pool.update.constraints.set", None),
    ("pool.delete", None),
    ("platform", Some(GLOBAL_ONLY)),
    ("platform.create", None),
    ("platform.read", None),
    ("platform.update", None),
    ("platform.delete", None),
    ("plan", Some(GLOBAL_ONLY)),
    ("plan.create", None),
    ("plan.read", None),
    ("plan.delete", None),
    ("volume", Some(VOLUME)),
    ("volume.create", None),
    ("volume.read", None),
    ("volume.delete", None),
    ("volume.update.bind", None),
    ("volume.update.unbind", None),
    ("webhook", Some(TEAM)),
    ("webhook.create", None),
    ("webhook.read", None),
    ("webhook.update", None),
    ("webhook.delete", None),
    ("router", Some(ROUTER)),
    ("router.create", Some(GLOBAL_ONLY)),
    ("router.read", None),
    ("router.update", None),
    ("router.delete", None),
    ("cluster", Some(GLOBAL_ONLY)),
    ("cluster.admin", None),
    ("cluster.create", None),
    ("cluster.read", None),
    ("cluster.update", None),
    ("cluster.delete", None),
    ("healing", Some(POOL)),
    ("healing.read", None),
    ("healing.update", None),
    ("install", Some(GLOBAL_ONLY)),
    ("install.manage", None),
    ("event-block", Some(GLOBAL_ONLY)),
    ("event-block.read", None),
    ("event-block.add", None),
    ("event-block.remove", None),
    ("role", Some(GLOBAL_ONLY)),
    ("role.create", None),
    ("role.read", None),
    ("role.read.events", None),
    ("role.delete", None),
    ("role.update", None),
    ("role.update.assign", None),
    ("role.update.dissociate", None),
    ("role.update.permission.add", None),
    ("role.update.permission.remove", None),
    ("role.update.context.type", None),
    ("role.update.name", None),
    ("role.update.description", None),
    ("role.default.create", None),
    ("role.default.delete", None),
    ("debug", Some(GLOBAL_ONLY)),
    ("debug.read", None),
];

/// Builds the registry used by a running control plane.
pub fn standard_registry() -> Result<PermissionRegistry> {
    let mut registry = PermissionRegistry::new();
    for (name, contexts) in ITEMS {
        registry.register(name, contexts.map(|c| c.to_vec()))?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_root_is_registered() {
        let reg = standard_registry().unwrap();
        for root in [
            "app",
            "node",
            "machine",
            "team",
            "user",
            "service",
            "service-instance",
            "pool",
            "platform",
            "plan",
            "volume",
            "webhook",
            "router",
            "cluster",
            "healing",
            "install",
            "event-block",
            "role",
            "debug",
        ] {
            let scheme = reg.get(root).unwrap();
            assert_eq!(scheme.parent().unwrap().id(), reg.root().id(), "{root}");
        }
    }

    #[test]
    fn service_instance_bind_is_allowed_for_instance_and_team() {
        let reg = standard_registry().unwrap();
        let bind = reg.get("service-instance.update.bind").unwrap();
        assert_eq!(bind.identifier(), "ServiceInstanceUpdateBind");
        assert_eq!(
            bind.allowed_contexts(),
            vec![
                ContextType::Global,
                ContextType::ServiceInstance,
                ContextType::Team
            ]
        );
    }

    #[test]
    fn global_only_subtrees() {
        let reg = standard_registry().unwrap();
        assert_eq!(
            reg.get("team.create").unwrap().allowed_contexts(),
            vec![ContextType::Global]
        );
        assert_eq!(
            reg.get("role.update.assign").unwrap().allowed_contexts(),
            vec![ContextType::Global]
        );
    }
}
